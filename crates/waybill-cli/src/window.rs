//! Shared `--date` / `--since` / `--until` arguments.

use clap::Args;
use time::{Duration, OffsetDateTime, UtcOffset};
use waybill_core::{clock, TimeWindow};

#[derive(Args, Debug, Clone, Default)]
pub struct WindowArgs {
    /// A single business day (YYYY-MM-DD); overrides --since/--until
    #[arg(long)]
    pub date: Option<String>,
    /// Window start: RFC 3339 timestamp or YYYY-MM-DD (default: 24h ago)
    #[arg(long)]
    pub since: Option<String>,
    /// Window end, exclusive: RFC 3339 timestamp or YYYY-MM-DD (default: now)
    #[arg(long)]
    pub until: Option<String>,
}

impl WindowArgs {
    pub fn resolve(&self, offset: UtcOffset) -> anyhow::Result<TimeWindow> {
        if let Some(date) = &self.date {
            return Ok(TimeWindow::day(clock::parse_date(date)?, offset));
        }
        let now = clock::now_utc();
        let end = match &self.until {
            Some(s) => parse_instant(s, offset)?,
            None => now,
        };
        let start = match &self.since {
            Some(s) => parse_instant(s, offset)?,
            None => end - Duration::DAY,
        };
        Ok(TimeWindow::new(start, end)?)
    }
}

/// RFC 3339 timestamp, or a bare date meaning its start in the business
/// offset.
pub fn parse_instant(s: &str, offset: UtcOffset) -> anyhow::Result<OffsetDateTime> {
    if let Ok(ts) = clock::parse_rfc3339(s) {
        return Ok(ts);
    }
    let date = clock::parse_date(s)
        .map_err(|_| anyhow::anyhow!("expected RFC 3339 timestamp or YYYY-MM-DD, got {s:?}"))?;
    Ok(TimeWindow::day(date, offset).start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, offset};

    #[test]
    fn date_resolves_to_business_day() {
        let args = WindowArgs {
            date: Some("2026-03-01".into()),
            ..Default::default()
        };
        let w = args.resolve(offset!(+7)).unwrap();
        assert_eq!(w.start, datetime!(2026-02-28 17:00 UTC));
        assert_eq!(w.end, datetime!(2026-03-01 17:00 UTC));
    }

    #[test]
    fn since_defaults_to_a_day_before_until() {
        let args = WindowArgs {
            until: Some("2026-03-02T00:00:00Z".into()),
            ..Default::default()
        };
        let w = args.resolve(UtcOffset::UTC).unwrap();
        assert_eq!(w.start, datetime!(2026-03-01 00:00 UTC));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_instant("yesterday", UtcOffset::UTC).is_err());
    }
}
