//! Temporal bucketing for time-keyed shards.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use super::fixed::{DateMillis, Fixed, FixedWidth};
use crate::error::{PlanBError, PlanBResult};
use crate::value::Val;

/// Granularity that event times are truncated to before keying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemporalResolution {
    Second,
    Minute,
    #[default]
    Hour,
    Day,
    /// Weeks start on Monday.
    Week,
    Month,
    Year,
}

impl TemporalResolution {
    /// Truncate epoch millis `ms` (UTC) to the start of its bucket.
    pub fn truncate(self, ms: i64) -> PlanBResult<i64> {
        let dt = DateTime::from_timestamp_millis(ms).ok_or_else(|| {
            PlanBError::InvariantViolation(format!("time {} ms is outside the supported range", ms))
        })?;
        let date = dt.date_naive();
        let start = match self {
            TemporalResolution::Second => return Ok(ms.div_euclid(1000) * 1000),
            TemporalResolution::Minute => return Ok(ms.div_euclid(60_000) * 60_000),
            TemporalResolution::Hour => return Ok(ms.div_euclid(3_600_000) * 3_600_000),
            TemporalResolution::Day => date,
            TemporalResolution::Week => {
                date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
            }
            TemporalResolution::Month => first_of(date.year(), date.month()),
            TemporalResolution::Year => first_of(date.year(), 1),
        };
        Ok(start.and_time(NaiveTime::MIN).and_utc().timestamp_millis())
    }
}

fn first_of(year: i32, month: u32) -> NaiveDate {
    // Day 1 exists for every valid year/month that chrono produced above.
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN)
}

/// Encodes bucketed times as order-preserving 8 byte dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeCodec {
    resolution: TemporalResolution,
}

impl TimeCodec {
    pub const SIZE: usize = DateMillis::SIZE;

    pub fn new(resolution: TemporalResolution) -> Self {
        Self { resolution }
    }

    pub fn resolution(&self) -> TemporalResolution {
        self.resolution
    }

    /// Truncate and append `ms` to `buf`.
    pub fn put(&self, buf: &mut Vec<u8>, ms: i64) -> PlanBResult<()> {
        let bucket = self.resolution.truncate(ms)?;
        buf.extend_from_slice(&DateMillis(bucket).encode());
        Ok(())
    }

    pub fn get(&self, bytes: &[u8]) -> PlanBResult<i64> {
        Ok(Fixed::<DateMillis>::decode(bytes)?.0)
    }

    pub fn read(&self, bytes: &[u8]) -> PlanBResult<Val> {
        Fixed::<DateMillis>::read(bytes)
    }
}
