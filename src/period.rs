//! Period keys, month keys and report identities.
//!
//! All keys are computed in the site's local time (a fixed UTC offset), so a
//! message sent at 01:00 local belongs to that local day even though it is
//! still the previous day in UTC. Observations are grouped by key equality.

use anyhow::Result;
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Timelike, Utc};

use crate::config::ReportsConfig;

/// Wall-clock helper bound to the site's UTC offset.
#[derive(Debug, Clone, Copy)]
pub struct SiteClock {
    offset: FixedOffset,
}

impl SiteClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn from_config(config: &ReportsConfig) -> Result<Self> {
        Ok(Self::new(config.offset()?))
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn local(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        at.with_timezone(&self.offset)
    }

    /// `YYYY-MM-DD` of the local day containing `at`.
    pub fn period_key(&self, at: DateTime<Utc>) -> String {
        self.local(at).format("%Y-%m-%d").to_string()
    }

    /// `YYYY-MM` of the local month containing `at`.
    pub fn month_key(&self, at: DateTime<Utc>) -> String {
        self.local(at).format("%Y-%m").to_string()
    }

    pub fn local_hour(&self, at: DateTime<Utc>) -> u32 {
        self.local(at).hour()
    }
}

/// Format a report identity such as `BN-FEB-26-007`.
pub fn format_report_id(prefix: &str, date: NaiveDate, count: i64) -> String {
    format!(
        "{}-{}-{:02}-{:03}",
        prefix,
        date.format("%b").to_string().to_uppercase(),
        date.year() % 100,
        count
    )
}
