//! Module that contains the reading type moved through the queue and its wire format.
use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ValidationError;

/// Format of the timestamp on the wire and in log output. Naive local time, second precision.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Keys every message body has to carry, in wire order.
pub const REQUIRED_FIELDS: [&str; 4] = ["id", "temperature", "humidity", "timestamp"];

/// Plausible temperature range in celsius.
pub const TEMPERATURE_RANGE: (f64, f64) = (-90.0, 70.0);
/// Plausible relative humidity range in percent.
pub const HUMIDITY_RANGE: (f64, f64) = (0.0, 100.0);

#[derive(Serialize, Debug, Clone, PartialEq)]
/// Struct representing one sample recorded by a sensor at a specific timestamp.
pub struct SensorReading
{
    /// Identifier of the reading. Not unique, the same value may show up many times.
    pub id: i64,
    /// Temperature value in celsius.
    #[serde(serialize_with = "two_decimals")]
    pub temperature: f64,
    /// Relative humidity value.
    #[serde(serialize_with = "two_decimals")]
    pub humidity: f64,
    /// Timestamp the reading was recorded, naive local time.
    #[serde(serialize_with = "naive_timestamp")]
    pub timestamp: NaiveDateTime,
}

impl SensorReading {
    /// Serializes the reading into the canonical message body.
    pub fn to_message(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Validates a raw message body and builds the reading it carries.
    ///
    /// # Errors
    ///
    /// * `ValidationError` - The body is not UTF-8 JSON, misses one of the required keys, carries
    ///     a value of the wrong type, an unparsable timestamp or a value outside the plausible range.
    ///     None of these can be fixed by delivering the message again.
    pub fn from_message(body: &[u8]) -> Result<SensorReading, ValidationError> {
        let text = std::str::from_utf8(body).map_err(|_| ValidationError::NotUtf8)?;
        let fields = match serde_json::from_str::<Value>(text.trim_end()) {
            Ok(Value::Object(fields)) => fields,
            Ok(other) => {
                return Err(ValidationError::Malformed(format!("expected an object, found '{}'", other)));
            }
            Err(err) => return Err(ValidationError::Malformed(err.to_string())),
        };

        let missing: Vec<&'static str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|key| !fields.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(ValidationError::MissingFields(missing));
        }

        let id = fields["id"].as_i64().ok_or_else(|| ValidationError::WrongType {
            field: "id",
            reason: format!("expected an integer, found '{}'", fields["id"]),
        })?;
        let temperature = number_field(&fields, "temperature")?;
        let humidity = number_field(&fields, "humidity")?;

        let raw_timestamp = fields["timestamp"].as_str().ok_or_else(|| ValidationError::WrongType {
            field: "timestamp",
            reason: format!("expected a string, found '{}'", fields["timestamp"]),
        })?;
        let timestamp = NaiveDateTime::parse_from_str(raw_timestamp, TIMESTAMP_FORMAT)
            .map_err(|_| ValidationError::InvalidTimestamp(raw_timestamp.to_string()))?;

        check_range("temperature", temperature, TEMPERATURE_RANGE)?;
        check_range("humidity", humidity, HUMIDITY_RANGE)?;

        Ok(SensorReading {
            id,
            temperature,
            humidity,
            timestamp,
        })
    }
}

/// Best effort extraction of the `id` from a body that failed validation, for log context.
pub fn message_id_hint(body: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(body).ok()?;
    serde_json::from_str::<Value>(text).ok()?.get("id")?.as_i64()
}

/// Rounds a value to two decimal places, the precision kept on the wire and in storage.
pub fn round_two_decimals(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn number_field(fields: &Map<String, Value>, field: &'static str) -> Result<f64, ValidationError> {
    fields[field].as_f64().ok_or_else(|| ValidationError::WrongType {
        field,
        reason: format!("expected a number, found '{}'", fields[field]),
    })
}

fn check_range(field: &'static str, value: f64, (min, max): (f64, f64)) -> Result<(), ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::OutOfRange { field, value, min, max });
    }
    Ok(())
}

fn two_decimals<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(round_two_decimals(*value))
}

fn naive_timestamp<S>(timestamp: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&timestamp.format(TIMESTAMP_FORMAT).to_string())
}
