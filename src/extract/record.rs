//! Daily observation records and the coercion of raw upstream values.
//!
//! The upstream encodes numbers as strings with comma decimal separators and
//! uses `""`, `"null"` and `"Ip"` (inappreciable precipitation) where a value
//! is missing. All of those become `None`, never zero. A record whose date is
//! missing or malformed, or whose fields hold something that is not a number,
//! is dropped with a warning; its neighbours are kept.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use super::constants::PLACEHOLDER_TOKEN;

/// Minutes per hour, for converting sunshine hours.
const MINUTES_PER_HOUR: f64 = 60.0;

/// One validated daily observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRecord {
    /// Observation day.
    pub date: NaiveDate,
    /// Mean temperature, °C.
    pub temp_avg: Option<f64>,
    /// Minimum temperature, °C.
    pub temp_min: Option<f64>,
    /// Maximum temperature, °C.
    pub temp_max: Option<f64>,
    /// Precipitation, mm.
    pub precipitation: Option<f64>,
    /// Direction of the maximum gust, tens of degrees as reported upstream.
    pub wind_direction: Option<f64>,
    /// Mean wind speed, m/s.
    pub wind_speed: Option<f64>,
    /// Maximum gust, m/s.
    pub wind_gust: Option<f64>,
    /// Mean of the reported daily maximum and minimum pressure, hPa.
    pub pressure: Option<f64>,
    /// Snow depth. Not reported by this upstream.
    pub snow: Option<f64>,
    /// Sunshine duration, minutes.
    pub sunshine_minutes: Option<f64>,
    /// Mean relative humidity, %.
    pub humidity: Option<f64>,
    /// Station the observation came from.
    pub station_id: String,
    /// Station latitude, decimal degrees.
    pub lat: Option<f64>,
    /// Station longitude, decimal degrees.
    pub lon: Option<f64>,
}

/// Why a raw record was dropped.
#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    /// The raw value is not a JSON object.
    #[error("record is not an object")]
    NotAnObject,

    /// The `fecha` field is absent.
    #[error("record has no date")]
    MissingDate,

    /// The `fecha` field is not `YYYY-MM-DD`.
    #[error("invalid record date: {0}")]
    InvalidDate(String),

    /// A numeric field holds something that is not a number.
    #[error("field {field} is not numeric: {value}")]
    NotNumeric {
        /// Upstream field name.
        field: &'static str,
        /// Raw value.
        value: String,
    },
}

/// Coerces a raw upstream value to a number.
///
/// Absent values, JSON null and the sentinel strings `""`, `"null"` and
/// `"Ip"` map to `Ok(None)`. Comma decimal separators are accepted.
///
/// ```
/// use serde_json::json;
/// use climate_extract::extract::parse_numeric;
///
/// assert_eq!(parse_numeric("tmed", Some(&json!("12,4"))), Ok(Some(12.4)));
/// assert_eq!(parse_numeric("prec", Some(&json!("Ip"))), Ok(None));
/// assert!(parse_numeric("prec", Some(&json!("abc"))).is_err());
/// ```
///
/// # Errors
///
/// Returns [`RecordError::NotNumeric`] when the value cannot be read as a number.
pub fn parse_numeric(field: &'static str, value: Option<&Value>) -> Result<Option<f64>, RecordError> {
    let not_numeric = |v: &Value| RecordError::NotNumeric {
        field,
        value: v.to_string(),
    };

    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_f64().map(Some).ok_or_else(|| not_numeric(&Value::Number(n.clone()))),
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() || s == "null" || s == PLACEHOLDER_TOKEN {
                return Ok(None);
            }
            s.replace(',', ".")
                .parse::<f64>()
                .map(Some)
                .map_err(|_| RecordError::NotNumeric {
                    field,
                    value: s.to_string(),
                })
        }
        Some(other) => Err(not_numeric(other)),
    }
}

/// Converts one raw upstream object into a [`DailyRecord`].
///
/// # Errors
///
/// Returns a [`RecordError`] describing why the record cannot be used.
pub fn parse_record(
    raw: &Value,
    station_id: &str,
    coords: Option<(f64, f64)>,
) -> Result<DailyRecord, RecordError> {
    let object = raw.as_object().ok_or(RecordError::NotAnObject)?;
    let field = |name: &'static str| parse_numeric(name, object.get(name));

    let date = match object.get("fecha") {
        Some(Value::String(s)) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map_err(|_| RecordError::InvalidDate(s.clone()))?,
        Some(other) => return Err(RecordError::InvalidDate(other.to_string())),
        None => return Err(RecordError::MissingDate),
    };

    let pressure = mean_of(&[field("presMax")?, field("presMin")?]);
    let sunshine_minutes = field("sol")?.map(|hours| hours * MINUTES_PER_HOUR);

    Ok(DailyRecord {
        date,
        temp_avg: field("tmed")?,
        temp_min: field("tmin")?,
        temp_max: field("tmax")?,
        precipitation: field("prec")?,
        wind_direction: field("dir")?,
        wind_speed: field("velmedia")?,
        wind_gust: field("racha")?,
        pressure,
        snow: None,
        sunshine_minutes,
        humidity: field("hrMedia")?,
        station_id: station_id.to_string(),
        lat: coords.map(|(lat, _)| lat),
        lon: coords.map(|(_, lon)| lon),
    })
}

/// Parses a batch of raw records, dropping (and logging) the ones that fail.
#[must_use]
pub fn parse_records(raw: &[Value], station_id: &str, coords: Option<(f64, f64)>) -> Vec<DailyRecord> {
    raw.iter()
        .enumerate()
        .filter_map(|(index, value)| match parse_record(value, station_id, coords) {
            Ok(record) => Some(record),
            Err(error) => {
                warn!(station_id, index, error = %error, "dropping unparseable record");
                None
            }
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn mean_of(values: &[Option<f64>]) -> Option<f64> {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    if present.is_empty() {
        None
    } else {
        Some(present.iter().sum::<f64>() / present.len() as f64)
    }
}
