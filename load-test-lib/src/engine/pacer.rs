use std::{sync::Arc, time::Duration};

use rama::telemetry::tracing;
use tokio::{
    sync::Semaphore,
    time::{self, MissedTickBehavior},
};

use super::stats::Stats;

/// Token bucket ticking at a fixed interval.
///
/// Each tick adds `rate × period` tokens. Whole tokens are handed out,
/// the fractional remainder carries over to the next tick.
/// Tokens that were granted but not yet consumed count towards the
/// capacity, so an idle period never turns into a burst.
#[derive(Debug, Clone)]
pub(super) struct TokenBucket {
    per_tick: f64,
    capacity: f64,
    fraction: f64,
}

impl TokenBucket {
    pub(super) fn new(rate: u64, period: Duration) -> Self {
        let per_tick = (rate as u128 * period.as_nanos()) as f64 / 1e9;
        Self {
            per_tick,
            capacity: (2.0 * per_tick).ceil().max(1.0),
            fraction: 0.0,
        }
    }

    pub(super) fn capacity(&self) -> u64 {
        self.capacity as u64
    }

    /// Advance one tick given the number of still unused tokens,
    /// returning how many new whole tokens to grant.
    pub(super) fn tick(&mut self, unused: usize) -> u64 {
        let unused = unused as f64;
        let total = (unused + self.fraction + self.per_tick).min(self.capacity);
        let whole = total.floor();
        self.fraction = total - whole;
        (whole - unused).max(0.0) as u64
    }
}

/// Permission-to-send gate shared by all connection lanes.
#[derive(Debug, Clone)]
pub(crate) struct RateGate {
    permits: Arc<Semaphore>,
}

impl RateGate {
    pub(crate) fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    /// Wait for a token. Returns `false` once the gate is closed.
    pub(crate) async fn acquire(&self) -> bool {
        match self.permits.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    pub(crate) fn close(&self) {
        self.permits.close();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub(super) fn unused(&self) -> usize {
        self.permits.available_permits()
    }

    pub(super) fn grant(&self, tokens: u64) {
        self.permits.add_permits(tokens as usize);
    }
}

/// Drives a [`TokenBucket`] and feeds the resulting tokens into a [`RateGate`].
#[derive(Debug)]
pub(crate) struct Pacer {
    gate: RateGate,
    bucket: TokenBucket,
    period: Duration,
    budget: Option<u64>,
    stats: Arc<Stats>,
}

impl Pacer {
    pub(crate) fn new(
        gate: RateGate,
        rate: u64,
        period: Duration,
        budget: Option<u64>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            gate,
            bucket: TokenBucket::new(rate, period),
            period,
            budget,
            stats,
        }
    }

    /// Tick until the gate is closed.
    ///
    /// With a budget the gate is closed by the pacer itself,
    /// as soon as the last budgeted token has been consumed.
    pub(crate) async fn run(mut self) {
        tracing::debug!(
            period = ?self.period,
            capacity = self.bucket.capacity(),
            budget = ?self.budget,
            "rate pacer started"
        );

        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let mut remaining = self.budget;
        loop {
            ticker.tick().await;
            if self.gate.is_closed() {
                break;
            }

            let unused = self.gate.unused();
            if remaining == Some(0) {
                if unused == 0 {
                    tracing::debug!("transaction budget used up: closing rate gate");
                    self.gate.close();
                    break;
                }
                continue;
            }

            let mut grant = self.bucket.tick(unused);
            if let Some(left) = remaining.as_mut() {
                grant = grant.min(*left);
                *left -= grant;
            }

            if grant > 0 {
                self.stats.record_tokens(grant);
                self.gate.grant(grant);
            }
        }

        tracing::debug!(
            tokens_granted = self.stats.tokens_granted(),
            "rate pacer stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::time::sleep;

    #[test]
    fn test_bucket_whole_tokens_per_tick() {
        let mut bucket = TokenBucket::new(100, Duration::from_millis(100));
        assert_eq!(bucket.capacity(), 20);
        assert_eq!(bucket.tick(0), 10);
        assert_eq!(bucket.tick(0), 10);
    }

    #[test]
    fn test_bucket_carries_fractions() {
        let mut bucket = TokenBucket::new(5, Duration::from_millis(100));
        let granted: u64 = (0..20).map(|_| bucket.tick(0)).sum();
        assert_eq!(granted, 10);
    }

    #[test]
    fn test_bucket_caps_unused_tokens() {
        let mut bucket = TokenBucket::new(100, Duration::from_millis(100));
        assert_eq!(bucket.tick(0), 10);
        // nobody consumed anything: only room for another 10
        assert_eq!(bucket.tick(10), 10);
        assert_eq!(bucket.tick(20), 0);
        assert_eq!(bucket.tick(15), 5);
    }

    #[test]
    fn test_bucket_minimum_capacity_is_one() {
        let mut bucket = TokenBucket::new(1, Duration::from_millis(100));
        assert_eq!(bucket.capacity(), 1);
        let granted: u64 = (0..10).map(|_| bucket.tick(0)).sum();
        assert_eq!(granted, 1);
        assert_eq!(bucket.tick(1), 0);
    }

    fn spawn_consumer(gate: RateGate) -> Arc<AtomicU64> {
        let consumed = Arc::new(AtomicU64::new(0));
        tokio::spawn({
            let consumed = consumed.clone();
            async move {
                while gate.acquire().await {
                    consumed.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        consumed
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_pacer_converges_to_rate() {
        time::pause();

        let stats = Arc::new(Stats::new());
        let gate = RateGate::new();
        let consumed = spawn_consumer(gate.clone());
        tokio::spawn(
            Pacer::new(gate.clone(), 10, Duration::from_millis(100), None, stats.clone()).run(),
        );

        sleep(Duration::from_millis(2050)).await;
        let n = consumed.load(Ordering::SeqCst);
        assert!((20..=21).contains(&n), "consumed {n} tokens");
        assert_eq!(stats.tokens_granted(), n);

        gate.close();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_pacer_no_burst_after_idle() {
        time::pause();

        let stats = Arc::new(Stats::new());
        let gate = RateGate::new();
        tokio::spawn(
            Pacer::new(gate.clone(), 100, Duration::from_millis(100), None, stats.clone()).run(),
        );

        // idle for a while: unused tokens stay capped at two ticks worth
        sleep(Duration::from_secs(5)).await;
        assert_eq!(gate.unused(), 20);
        assert_eq!(stats.tokens_granted(), 20);

        gate.close();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_pacer_respects_budget() {
        time::pause();

        let stats = Arc::new(Stats::new());
        let gate = RateGate::new();
        let consumed = spawn_consumer(gate.clone());
        let pacer = tokio::spawn(
            Pacer::new(gate.clone(), 100, Duration::from_millis(100), Some(25), stats.clone())
                .run(),
        );

        pacer.await.unwrap();
        assert!(gate.is_closed());
        assert_eq!(consumed.load(Ordering::SeqCst), 25);
        assert_eq!(stats.tokens_granted(), 25);
    }
}
