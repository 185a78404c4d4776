use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::token;

/// Point in time carried as a native date (nanoseconds since the Unix epoch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Date {
    nanos: i64,
}

impl Date {
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    pub fn from_unix_nanos(nanos: i64) -> Self {
        Self { nanos }
    }

    pub fn unix_nanos(&self) -> i64 {
        self.nanos
    }

    pub fn to_system_time(&self) -> SystemTime {
        let magnitude = Duration::from_nanos(self.nanos.unsigned_abs());
        if self.nanos >= 0 {
            UNIX_EPOCH + magnitude
        } else {
            UNIX_EPOCH - magnitude
        }
    }
}

impl From<SystemTime> for Date {
    fn from(time: SystemTime) -> Self {
        // Saturates outside roughly +/-292 years of the epoch.
        let nanos = match time.duration_since(UNIX_EPOCH) {
            Ok(after) => i64::try_from(after.as_nanos()).unwrap_or(i64::MAX),
            Err(before) => i64::try_from(before.duration().as_nanos())
                .map(|n| -n)
                .unwrap_or(i64::MIN),
        };
        Self { nanos }
    }
}

impl From<Date> for SystemTime {
    fn from(date: Date) -> Self {
        date.to_system_time()
    }
}

impl Serialize for Date {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_newtype_struct(token::DATE, &self.nanos)
    }
}

impl<'de> Deserialize<'de> for Date {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_newtype_struct(token::DATE, DateVisitor)
    }
}

struct DateVisitor;

impl<'de> Visitor<'de> for DateVisitor {
    type Value = Date;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a date")
    }

    fn visit_newtype_struct<D: Deserializer<'de>>(self, d: D) -> Result<Date, D::Error> {
        i64::deserialize(d).map(Date::from_unix_nanos)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Date, E> {
        Ok(Date::from_unix_nanos(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Date, E> {
        i64::try_from(v)
            .map(Date::from_unix_nanos)
            .map_err(|_| E::invalid_value(de::Unexpected::Unsigned(v), &self))
    }
}
