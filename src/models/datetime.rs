//! Defines custom `DateTime` type.

use std::fmt;

use redis::{self, ToRedisArgs};
use serde::Serialize;

/// Thin wrapper around a `chrono::DateTime<Utc>` with functions for custom serialisation.
#[derive(Clone, Debug, PartialEq, PartialOrd, Serialize)]
pub struct DateTime(chrono::DateTime<chrono::Utc>);

impl DateTime {
    /// Get current UTC date/time.
    pub fn now() -> Self {
        DateTime(chrono::Utc::now())
    }

    /// Get this date/time as seconds since the unix epoch.
    pub fn unix(&self) -> i64 {
        self.0.timestamp()
    }
}

impl ToRedisArgs for DateTime {
    /// Format this struct as an RFC3339 date string for storage in Redis.
    fn write_redis_args<W: ?Sized + redis::RedisWrite>(&self, out: &mut W) {
        self.0.to_rfc3339().write_redis_args(out)
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unix_seconds_are_monotonic() {
        let a = DateTime::now();
        let b = DateTime::now();
        assert!(b.unix() >= a.unix());
    }

    #[test]
    fn displays_as_rfc3339() {
        let dt = DateTime::now();
        let s = dt.to_string();
        assert!(chrono::DateTime::parse_from_rfc3339(&s).is_ok());
    }
}
