//! Statistics counters with hierarchical aggregation.
//!
//! A [`StatisticCounter`] keeps a cumulative byte total plus ring-bucketed
//! totals over registered short windows, and may be linked to a parent so
//! that per-peer counters feed torrent-wide aggregates on every add.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A short statistics window: `bucket_count` consecutive buckets of
/// `bucket_duration` each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    bucket_duration: Duration,
    bucket_count: usize,
}

impl Period {
    /// Creates a period of `bucket_count` buckets of `bucket_duration` each.
    pub const fn new(bucket_duration: Duration, bucket_count: usize) -> Self {
        Self {
            bucket_duration,
            bucket_count,
        }
    }

    /// Total duration spanned by the window.
    pub fn total_duration(&self) -> Duration {
        self.bucket_duration * self.bucket_count as u32
    }
}

// Ring of bucketed totals for one registered period.
#[derive(Debug)]
struct PeriodBuckets {
    period: Period,
    buckets: Vec<u64>,
    head: usize,
    head_start: Instant,
}

impl PeriodBuckets {
    fn new(period: Period, now: Instant) -> Self {
        Self {
            period,
            buckets: vec![0; period.bucket_count],
            head: 0,
            head_start: now,
        }
    }

    // Rotates the ring forward so the head bucket covers `now`.
    fn advance(&mut self, now: Instant) {
        let bucket = self.period.bucket_duration;
        let mut elapsed = now.saturating_duration_since(self.head_start);
        let mut steps = 0usize;
        while elapsed >= bucket && steps < self.period.bucket_count {
            elapsed -= bucket;
            steps += 1;
            self.head = (self.head + 1) % self.period.bucket_count;
            self.buckets[self.head] = 0;
            self.head_start += bucket;
        }
        if steps == self.period.bucket_count {
            // Fully stale: everything already zeroed, just resynchronise.
            self.head_start = now;
        }
    }

    fn add(&mut self, amount: u64, now: Instant) {
        self.advance(now);
        self.buckets[self.head] += amount;
    }

    fn total(&mut self, now: Instant) -> u64 {
        self.advance(now);
        self.buckets.iter().sum()
    }
}

#[derive(Debug, Default)]
struct CounterInner {
    total: u64,
    periods: Vec<PeriodBuckets>,
    parent: Option<StatisticCounter>,
}

/// A cumulative counter with optional short-window totals and an optional
/// parent aggregate.
///
/// Handles are cheap to clone and share one underlying counter, so a peer
/// engine and its outbound queue can both credit the same total.
#[derive(Debug, Clone, Default)]
pub struct StatisticCounter {
    inner: Arc<Mutex<CounterInner>>,
}

impl StatisticCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Links this counter to a parent. Subsequent adds propagate upward.
    pub fn set_parent(&self, parent: &StatisticCounter) {
        self.inner.lock().parent = Some(parent.clone());
    }

    /// Registers a short window over which totals will be tracked.
    /// Registering the same period twice is a no-op.
    pub fn add_counted_period(&self, period: Period) {
        let mut inner = self.inner.lock();
        if !inner.periods.iter().any(|p| p.period == period) {
            inner.periods.push(PeriodBuckets::new(period, Instant::now()));
        }
    }

    /// Adds to the cumulative total, every registered window, and the parent
    /// chain.
    pub fn add(&self, amount: u64) {
        let parent = {
            let mut inner = self.inner.lock();
            inner.total += amount;
            let now = Instant::now();
            for buckets in &mut inner.periods {
                buckets.add(amount, now);
            }
            inner.parent.clone()
        };
        if let Some(parent) = parent {
            parent.add(amount);
        }
    }

    /// The cumulative total.
    pub fn total(&self) -> u64 {
        self.inner.lock().total
    }

    /// The total accumulated over a registered window, or 0 if the period
    /// was never registered.
    pub fn period_total(&self, period: Period) -> u64 {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner
            .periods
            .iter_mut()
            .find(|p| p.period == period)
            .map(|p| p.total(now))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cumulative_total() {
        let counter = StatisticCounter::new();
        counter.add(10);
        counter.add(32);
        assert_eq!(counter.total(), 42);
    }

    #[test]
    fn parent_aggregation() {
        let parent = StatisticCounter::new();
        let a = StatisticCounter::new();
        let b = StatisticCounter::new();
        a.set_parent(&parent);
        b.set_parent(&parent);

        a.add(5);
        b.add(7);
        assert_eq!(a.total(), 5);
        assert_eq!(b.total(), 7);
        assert_eq!(parent.total(), 12);
    }

    #[test]
    fn period_totals_bounded_by_cumulative() {
        let period = Period::new(Duration::from_secs(1), 2);
        let counter = StatisticCounter::new();
        counter.add_counted_period(period);
        counter.add(100);
        counter.add(50);
        assert_eq!(counter.period_total(period), 150);
        assert!(counter.period_total(period) <= counter.total());
    }

    #[test]
    fn unregistered_period_reads_zero() {
        let counter = StatisticCounter::new();
        counter.add(9);
        assert_eq!(counter.period_total(Period::new(Duration::from_secs(1), 4)), 0);
    }

    #[test]
    fn shared_handles_credit_one_total() {
        let counter = StatisticCounter::new();
        let other = counter.clone();
        counter.add(1);
        other.add(2);
        assert_eq!(counter.total(), 3);
    }
}
