//! Timecode arithmetic.
//!
//! A timecode is `floor(unix_seconds / 100_000)`: a five-digit bucket id that
//! rolls over roughly once a day. Files are grouped into buckets by the
//! timecode of their registration moment.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Width of one timecode bucket, in seconds.
pub const TIMECODE_SECONDS: i64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timecode(pub i64);

impl Timecode {
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.timestamp().div_euclid(TIMECODE_SECONDS))
    }

    pub fn current() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// First instant belonging to this bucket, `None` outside the range
    /// chrono can represent.
    pub fn start(self) -> Option<DateTime<Utc>> {
        let secs = self.0.checked_mul(TIMECODE_SECONDS)?;
        Utc.timestamp_opt(secs, 0).single()
    }

    /// Number of whole buckets between `self` and a later timecode.
    pub fn buckets_until(self, later: Timecode) -> i64 {
        later.0.saturating_sub(self.0)
    }
}

impl fmt::Display for Timecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for Timecode {
    fn from(v: i64) -> Self {
        Self(v)
    }
}
