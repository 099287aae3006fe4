//! Synthetic sensor readings for feeding the queue.
use chrono::{Local, NaiveDateTime, Timelike};
use rand::distributions::Uniform;
use rand::Rng;

use crate::record::{round_two_decimals, SensorReading};

/// Range the reading identifiers are drawn from.
pub const ID_RANGE: (i64, i64) = (1000, 9999);
/// Range of generated temperatures in celsius.
pub const TEMPERATURE_RANGE: (f64, f64) = (10.0, 35.0);
/// Range of generated relative humidity values.
pub const HUMIDITY_RANGE: (f64, f64) = (20.0, 80.0);

/// Generate a reading stamped with the current local time.
pub fn reading() -> SensorReading {
    reading_at(now_to_the_second())
}

/// Generate a reading with random id and values stamped with `timestamp`.
pub fn reading_at(timestamp: NaiveDateTime) -> SensorReading {
    let mut rng = rand::thread_rng();

    SensorReading {
        id: rng.sample(Uniform::new_inclusive(ID_RANGE.0, ID_RANGE.1)),
        temperature: round_two_decimals(rng.sample(Uniform::new(TEMPERATURE_RANGE.0, TEMPERATURE_RANGE.1))),
        humidity: round_two_decimals(rng.sample(Uniform::new(HUMIDITY_RANGE.0, HUMIDITY_RANGE.1))),
        timestamp,
    }
}

fn now_to_the_second() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}
