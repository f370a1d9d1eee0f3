//! Testable time source and half-open interval arithmetic.
//!
//! All time-dependent scheduling decisions go through the [`Clock`] trait so
//! tests can substitute a fixed instant. An [`Interval`] is half-open:
//! it includes `begin` and excludes `end`.

use std::fmt;

use chrono::{DateTime, Duration, Utc};

/// Format used when rendering timestamps for humans and wire payloads,
/// UTC with minute precision.
pub const TIMESTAMP_FORMAT: &str = "%Y/%m/%d/%H/%M";

/// The sole source of time for scheduling decisions.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a fixed instant, for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// A half-open interval of time: includes `begin`, excludes `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    /// Inclusive lower bound.
    pub begin: DateTime<Utc>,
    /// Exclusive upper bound.
    pub end: DateTime<Utc>,
}

impl Interval {
    /// Creates a new interval `[begin, end)`.
    #[must_use]
    pub const fn new(begin: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { begin, end }
    }

    /// Returns true if `instant` falls within the interval.
    #[must_use]
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.begin && instant < self.end
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to {}",
            self.begin.format(TIMESTAMP_FORMAT),
            self.end.format(TIMESTAMP_FORMAT)
        )
    }
}

/// Computes the aggregation window for the current instant.
///
/// The window ends at `now - grace_period`, floored to a multiple of
/// `aggregation_period` since the epoch, and spans exactly one period:
///
/// ```text
/// end   = truncate(now - grace_period, aggregation_period)
/// begin = end - aggregation_period
/// ```
///
/// The window therefore slides forward by one period at each period
/// boundary once the grace period has elapsed past that boundary.
#[must_use]
pub fn aggregation_interval(
    clock: &dyn Clock,
    aggregation_period: Duration,
    grace_period: Duration,
) -> Interval {
    let end = truncate_to_period(clock.now() - grace_period, aggregation_period);
    Interval::new(end - aggregation_period, end)
}

/// Floors `instant` to the nearest multiple of `period` since the epoch.
fn truncate_to_period(instant: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    let period_secs = period.num_seconds().max(1);
    let excess_secs = instant.timestamp().rem_euclid(period_secs);
    let excess_nanos = i64::from(instant.timestamp_subsec_nanos());
    instant - Duration::seconds(excess_secs) - Duration::nanoseconds(excess_nanos)
}
