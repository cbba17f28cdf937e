//! In-memory station inventory with nearest-station matching.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, warn};

use super::{Station, StationId, StationResolver, dms_to_decimal};
use crate::extract::parse_numeric;

/// Inventory entry as delivered by the upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct RawStation {
    /// Station id.
    pub indicativo: String,
    /// Station name.
    #[serde(default)]
    pub nombre: String,
    /// Province.
    #[serde(default)]
    pub provincia: String,
    /// Latitude, packed DMS.
    #[serde(default)]
    pub latitud: String,
    /// Longitude, packed DMS.
    #[serde(default)]
    pub longitud: String,
    /// Altitude in metres, as text.
    #[serde(default)]
    pub altitud: Option<serde_json::Value>,
}

/// Stations known to the upstream, indexed by id.
#[derive(Debug, Clone, Default)]
pub struct StationInventory {
    stations: Vec<Station>,
    by_id: HashMap<StationId, usize>,
}

impl StationInventory {
    /// Builds an inventory from decoded stations.
    #[must_use]
    pub fn new(stations: Vec<Station>) -> Self {
        let by_id = stations
            .iter()
            .enumerate()
            .map(|(index, station)| (station.id.clone(), index))
            .collect();
        Self { stations, by_id }
    }

    /// Builds an inventory from raw upstream entries.
    ///
    /// Entries whose coordinates cannot be parsed are left out so they can
    /// never win a nearest-station match.
    #[must_use]
    pub fn from_raw(raw: Vec<RawStation>) -> Self {
        let total = raw.len();
        let stations: Vec<Station> = raw
            .into_iter()
            .filter_map(|entry| {
                let (Some(latitude), Some(longitude)) =
                    (dms_to_decimal(&entry.latitud), dms_to_decimal(&entry.longitud))
                else {
                    warn!(
                        station = %entry.indicativo,
                        latitud = %entry.latitud,
                        longitud = %entry.longitud,
                        "skipping station with unparseable coordinates"
                    );
                    return None;
                };
                Some(Station {
                    id: StationId::new(&entry.indicativo),
                    name: entry.nombre.trim().to_string(),
                    province: entry.provincia.trim().to_string(),
                    latitude,
                    longitude,
                    altitude: parse_numeric("altitud", entry.altitud.as_ref()).ok().flatten(),
                })
            })
            .collect();
        debug!(total, usable = stations.len(), "loaded station inventory");
        Self::new(stations)
    }

    /// Number of stations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stations.len()
    }

    /// Whether the inventory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    /// All stations, in upstream order.
    #[must_use]
    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    /// Looks up a station by id.
    #[must_use]
    pub fn get(&self, id: &StationId) -> Option<&Station> {
        self.by_id.get(id).map(|&index| &self.stations[index])
    }

    /// `(lat, lon)` of the station with `id`.
    #[must_use]
    pub fn coordinates(&self, id: &StationId) -> Option<(f64, f64)> {
        self.get(id).map(|s| (s.latitude, s.longitude))
    }

    /// Station closest to `(lat, lon)` by planar distance in degrees.
    ///
    /// Ties keep the first station in inventory order.
    #[must_use]
    pub fn nearest(&self, lat: f64, lon: f64) -> Option<&Station> {
        self.stations
            .iter()
            .map(|station| {
                let distance = (lat - station.latitude).hypot(lon - station.longitude);
                (distance, station)
            })
            .filter(|(distance, _)| distance.is_finite())
            .fold(None, |best: Option<(f64, &Station)>, candidate| match best {
                Some(current) if current.0 <= candidate.0 => Some(current),
                _ => Some(candidate),
            })
            .map(|(_, station)| station)
    }
}

impl StationResolver for StationInventory {
    fn resolve(&self, lat: f64, lon: f64) -> Option<StationId> {
        self.nearest(lat, lon).map(|station| station.id.clone())
    }
}
