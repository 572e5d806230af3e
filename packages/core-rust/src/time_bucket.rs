//! Time buckets: coarse UTC timestamps that group metrics into fixed windows.
//!
//! A bucket is the decimal `yyyyMMdd[HH[mm[ss]]]` rendering of a timestamp
//! truncated to the bucket's precision, e.g. `2024010100` for the hour
//! starting at 2024-01-01T00:00Z. Buckets sort chronologically as integers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Precision of a time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeBucket {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeBucket {
    fn pattern(self) -> &'static str {
        match self {
            Self::Second => "%Y%m%d%H%M%S",
            Self::Minute => "%Y%m%d%H%M",
            Self::Hour => "%Y%m%d%H",
            Self::Day => "%Y%m%d",
        }
    }

    /// Bucket containing `timestamp_ms` (milliseconds since the Unix epoch).
    ///
    /// Returns `None` for timestamps chrono cannot represent.
    ///
    /// # Examples
    ///
    /// ```
    /// use apm_core::time_bucket::TimeBucket;
    ///
    /// // 2024-01-01T00:59:59.999Z
    /// assert_eq!(TimeBucket::Hour.bucket(1_704_070_799_999), Some(2_024_010_100));
    /// assert_eq!(TimeBucket::Day.bucket(1_704_070_799_999), Some(20_240_101));
    /// ```
    #[must_use]
    pub fn bucket(self, timestamp_ms: i64) -> Option<i64> {
        let at = DateTime::<Utc>::from_timestamp_millis(timestamp_ms)?;
        at.format(self.pattern()).to_string().parse().ok()
    }
}

/// Aggregation key of `entity` within `bucket`, e.g. `svc-1_2024010100`.
#[must_use]
pub fn record_id(entity: &str, bucket: i64) -> String {
    format!("{entity}_{bucket}")
}
