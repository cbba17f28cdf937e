//! Station lookup for coordinate-based extraction runs.
//!
//! # Architecture
//!
//! - [`StationResolver`] - trait mapping a coordinate to a station id
//! - [`Station`] - one entry of the upstream station inventory
//! - [`StationInventory`] - in-memory inventory with nearest-station matching
//! - [`dms_to_decimal`] - parses the inventory's packed DMS coordinates

mod inventory;

pub use inventory::{RawStation, StationInventory};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque upstream station identifier, e.g. `5790Y`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(String);

impl StationId {
    /// Wraps a raw identifier, trimming surrounding whitespace.
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_string())
    }

    /// The identifier as sent to the upstream.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A measuring station with decimal coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Station {
    /// Upstream identifier.
    pub id: StationId,
    /// Station name.
    pub name: String,
    /// Province.
    pub province: String,
    /// Latitude, decimal degrees (south negative).
    pub latitude: f64,
    /// Longitude, decimal degrees (west negative).
    pub longitude: f64,
    /// Altitude in metres, when reported.
    pub altitude: Option<f64>,
}

/// Maps a coordinate to the station that serves it.
pub trait StationResolver: Send + Sync {
    /// Returns the station for `(lat, lon)`, or `None` if none is available.
    fn resolve(&self, lat: f64, lon: f64) -> Option<StationId>;
}

/// Converts a packed DMS coordinate (`DDMMSS` + hemisphere, e.g. `402646N`)
/// to signed decimal degrees.
///
/// Degrees are the first two digits, minutes the next two, seconds the rest.
/// `S` and `W` are negative. Returns `None` for anything else.
///
/// ```
/// use climate_extract::station::dms_to_decimal;
///
/// let lat = dms_to_decimal("402646N").unwrap();
/// assert!((lat - 40.446_111).abs() < 1e-5);
/// assert!(dms_to_decimal("034103W").unwrap() < 0.0);
/// assert_eq!(dms_to_decimal("garbage"), None);
/// ```
#[must_use]
pub fn dms_to_decimal(dms: &str) -> Option<f64> {
    let dms = dms.trim();
    let hemisphere = dms.chars().last()?.to_ascii_uppercase();
    let digits = &dms[..dms.len() - hemisphere.len_utf8()];
    if digits.len() < 5 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let degrees: f64 = digits[..2].parse().ok()?;
    let minutes: f64 = digits[2..4].parse().ok()?;
    let seconds: f64 = digits[4..].parse().ok()?;
    let decimal = degrees + minutes / 60.0 + seconds / 3600.0;

    match hemisphere {
        'N' | 'E' => Some(decimal),
        'S' | 'W' => Some(-decimal),
        _ => None,
    }
}
