pub mod daily;
pub mod degradation;
pub mod hourly;
pub mod supplementary;
pub mod ten_minute;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use pipeline_core::{Error, Result};

pub use daily::DailyAggregator;
pub use degradation::DegradationRing;
pub use hourly::HourlyAggregator;
pub use supplementary::SupplementaryFetcher;
pub use ten_minute::TenMinuteRefresher;

/// Capability shared by every refresher: it can be told to run once, outside
/// its normal schedule.
#[async_trait]
pub trait Refresher: Send + Sync {
    fn name(&self) -> &str;
    async fn refresh(&self) -> Result<()>;
}

/// Parses a bucket timestamp in either of the two formats the analytics
/// backend emits: RFC3339/ISO, or `"YYYY-MM-DD HH:MM:SS"` (assumed UTC).
pub fn parse_bucket_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }

    let trimmed = raw.trim_end_matches(" UTC");
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }

    Err(Error::Validation(format!("unrecognised bucket timestamp: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_accepted_formats() {
        let iso = parse_bucket_timestamp("2026-01-07T12:30:00Z").unwrap();
        let plain = parse_bucket_timestamp("2026-01-07 12:30:00").unwrap();
        let with_utc_suffix = parse_bucket_timestamp("2026-01-07 12:30:00 UTC").unwrap();

        assert_eq!(iso, plain);
        assert_eq!(iso, with_utc_suffix);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_bucket_timestamp("not-a-date").is_err());
    }
}
