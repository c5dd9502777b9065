//! Wire-tolerant timestamps.
//!
//! The control plane is inconsistent about timestamp encoding: some
//! resources carry RFC 3339 strings, others Unix seconds. [`FlexibleTime`]
//! decodes either form and always encodes Unix seconds.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

/// A timestamp that decodes from an RFC 3339 string or a Unix-seconds
/// integer, and encodes as Unix seconds.
///
/// The zero value (no time set) encodes as `0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlexibleTime(Option<DateTime<Utc>>);

impl FlexibleTime {
    /// The zero time.
    pub const ZERO: Self = Self(None);

    /// Wrap a concrete instant.
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self(Some(time))
    }

    /// Build from Unix seconds.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is outside chrono's representable range.
    pub fn from_unix(secs: i64) -> Result<Self, CoreError> {
        DateTime::from_timestamp(secs, 0)
            .map(Self::new)
            .ok_or_else(|| CoreError::InvalidTime(format!("unix seconds out of range: {secs}")))
    }

    /// Parse an RFC 3339 string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid RFC 3339.
    pub fn parse_rfc3339(s: &str) -> Result<Self, CoreError> {
        DateTime::parse_from_rfc3339(s)
            .map(|t| Self::new(t.with_timezone(&Utc)))
            .map_err(|e| CoreError::InvalidTime(format!("{s:?}: {e}")))
    }

    /// Whether no time is set.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0.is_none()
    }

    /// The wrapped instant, if set.
    #[must_use]
    pub const fn as_datetime(&self) -> Option<&DateTime<Utc>> {
        self.0.as_ref()
    }

    /// Unix seconds, with the zero time mapping to `0`.
    #[must_use]
    pub fn unix_seconds(&self) -> i64 {
        self.0.map_or(0, |t| t.timestamp())
    }
}

impl From<DateTime<Utc>> for FlexibleTime {
    fn from(time: DateTime<Utc>) -> Self {
        Self::new(time)
    }
}

impl fmt::Display for FlexibleTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(t) => write!(f, "{}", t.to_rfc3339()),
            None => f.write_str("0"),
        }
    }
}

impl Serialize for FlexibleTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.unix_seconds())
    }
}

struct FlexibleTimeVisitor;

impl Visitor<'_> for FlexibleTimeVisitor {
    type Value = FlexibleTime;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an RFC 3339 string or Unix seconds")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        FlexibleTime::from_unix(v).map_err(E::custom)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        let secs = i64::try_from(v).map_err(E::custom)?;
        self.visit_i64(secs)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        if v.is_empty() {
            return Ok(FlexibleTime::ZERO);
        }
        FlexibleTime::parse_rfc3339(v).map_err(E::custom)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(FlexibleTime::ZERO)
    }
}

impl<'de> Deserialize<'de> for FlexibleTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(FlexibleTimeVisitor)
    }
}
