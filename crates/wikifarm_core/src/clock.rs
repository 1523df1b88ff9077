use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};

/// MediaWiki `TS_MW` timestamp layout used for every persisted time.
const MW_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Source of "now" for everything that stamps a row.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock, truncated to whole seconds so in-memory values match what a
/// reload from storage produces.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(0)
    }
}

pub fn format_mw_timestamp(value: DateTime<Utc>) -> String {
    value.format(MW_TIMESTAMP_FORMAT).to_string()
}

pub fn parse_mw_timestamp(value: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), MW_TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .with_context(|| format!("invalid timestamp {value:?}"))
}
