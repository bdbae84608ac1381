//! Microsecond timestamps used for LWW comparison.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point in time as whole microseconds since the Unix epoch.
///
/// All timestamps entering the set are truncated to this resolution before
/// they are compared or stored, so two replicas always compare the same
/// integer values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The Unix epoch. Malformed replication timestamps decode to this.
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub fn as_micros(self) -> i64 {
        self.0
    }

    /// Truncates `at` down to the microsecond.
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.timestamp_micros())
    }

    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Values past the range `DateTime<Utc>` can hold are clamped to its
    /// nearest bound, so ordering between timestamps is kept.
    pub fn to_datetime(self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(self.0).unwrap_or(if self.0 > 0 {
            DateTime::<Utc>::MAX_UTC
        } else {
            DateTime::<Utc>::MIN_UTC
        })
    }

    /// Parses the decimal form used on the wire.
    ///
    /// Anything that is not an integer becomes [`Timestamp::ZERO`], which
    /// loses every real comparison instead of failing the caller.
    pub fn parse_lossy(raw: &str) -> Self {
        raw.parse().map(Self).unwrap_or(Self::ZERO)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(at: DateTime<Utc>) -> Self {
        Self::from_datetime(at)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(ts: Timestamp) -> Self {
        ts.to_datetime()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
