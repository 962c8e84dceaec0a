use chrono::{DateTime, NaiveDate, Utc};

/// Time source for ingestion timestamps and date-stamped filenames.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Ingestion date in UTC.
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a single instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Convert a provider timestamp (seconds) to UTC, falling back to `clock`.
pub fn timestamp_or_now(seconds: Option<i64>, clock: &dyn Clock) -> DateTime<Utc> {
    seconds
        .filter(|secs| *secs > 0)
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(|| clock.now())
}
