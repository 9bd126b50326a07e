//! Lock-free run statistics.
//!
//! Every submission is recorded exactly once, either as succeeded or
//! as failed. `attempted` is derived from both, which keeps
//! `attempted == succeeded + failed` true for every snapshot.
//! Issued submissions without an outcome yet are reported as `in_flight`.

use std::{
    io::Write,
    iter::Sum,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use rama::error::{BoxError, ErrorContext as _};
use serde::{Deserialize, Serialize};

/// Upper bounds (in milliseconds) of the latency histogram buckets.
pub const LATENCY_BUCKETS_MS: [u64; 12] = [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

#[derive(Debug)]
pub struct Stats {
    issued: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
    tokens_granted: AtomicU64,
    latency: LatencyRecorder,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            issued: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            tokens_granted: AtomicU64::new(0),
            latency: LatencyRecorder::new(),
        }
    }

    /// A transaction was handed to a transport. Its outcome follows later.
    pub fn record_issue(&self) {
        self.issued.fetch_add(1, Ordering::Release);
    }

    pub fn record_success(&self, bytes: usize, latency: Duration) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.latency.record(latency);
        self.succeeded.fetch_add(1, Ordering::Release);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Release);
    }

    pub fn record_tokens(&self, tokens: u64) {
        self.tokens_granted.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn tokens_granted(&self) -> u64 {
        self.tokens_granted.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let succeeded = self.succeeded.load(Ordering::Acquire);
        let failed = self.failed.load(Ordering::Acquire);
        let issued = self.issued.load(Ordering::Acquire);
        StatsSnapshot {
            attempted: succeeded + failed,
            in_flight: issued.saturating_sub(succeeded + failed),
            succeeded,
            failed,
            bytes: self.bytes.load(Ordering::Relaxed),
            tokens_granted: self.tokens_granted.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

#[derive(Debug)]
struct LatencyRecorder {
    count: AtomicU64,
    sum_us: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len()],
}

impl LatencyRecorder {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn record(&self, latency: Duration) {
        let us = latency.as_micros().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.min_us.fetch_min(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);

        if let Some(idx) = LATENCY_BUCKETS_MS
            .iter()
            .position(|upper_ms| us <= upper_ms * 1000)
        {
            self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let min_us = self.min_us.load(Ordering::Relaxed);
        LatencySnapshot {
            count,
            sum_us: self.sum_us.load(Ordering::Relaxed),
            min_us: if count == 0 || min_us == u64::MAX {
                0
            } else {
                min_us
            },
            max_us: self.max_us.load(Ordering::Relaxed),
            buckets: std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub bytes: u64,
    pub tokens_granted: u64,
    /// Issued but not yet settled. A gauge, not a counter.
    #[serde(default)]
    pub in_flight: u64,
    #[serde(default)]
    pub latency: LatencySnapshot,
}

/// Latency distribution of successful submissions.
///
/// Buckets are non-cumulative; submissions slower than the last bound
/// only show up in `count`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub sum_us: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub buckets: [u64; LATENCY_BUCKETS_MS.len()],
}

impl LatencySnapshot {
    pub fn mean(&self) -> Option<Duration> {
        (self.count > 0).then(|| Duration::from_micros(self.sum_us / self.count))
    }

    pub fn merge(&mut self, other: &Self) {
        if other.count == 0 {
            return;
        }
        self.min_us = if self.count == 0 {
            other.min_us
        } else {
            self.min_us.min(other.min_us)
        };
        self.count += other.count;
        self.sum_us += other.sum_us;
        self.max_us = self.max_us.max(other.max_us);
        for (bucket, value) in self.buckets.iter_mut().zip(other.buckets) {
            *bucket += value;
        }
    }
}

impl StatsSnapshot {
    pub fn merge(&mut self, other: &Self) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.bytes += other.bytes;
        self.tokens_granted += other.tokens_granted;
        self.in_flight += other.in_flight;
        self.latency.merge(&other.latency);
    }

    pub fn is_consistent(&self) -> bool {
        self.attempted == self.succeeded + self.failed
    }

    /// True if no counter of `self` is behind the one in `other`.
    pub fn dominates(&self, other: &Self) -> bool {
        self.attempted >= other.attempted
            && self.succeeded >= other.succeeded
            && self.failed >= other.failed
            && self.bytes >= other.bytes
            && self.tokens_granted >= other.tokens_granted
    }

    /// Average submitted transactions per second over the given time.
    pub fn rate(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.attempted as f64 / secs
        } else {
            0.0
        }
    }
}

impl Sum for StatsSnapshot {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |mut acc, snapshot| {
            acc.merge(&snapshot);
            acc
        })
    }
}

impl<'a> Sum<&'a StatsSnapshot> for StatsSnapshot {
    fn sum<I: Iterator<Item = &'a StatsSnapshot>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

/// Write the final summary as a `Parameter,Value,Units` CSV table.
pub fn write_summary_csv(
    mut w: impl Write,
    elapsed: Duration,
    stats: &StatsSnapshot,
) -> Result<(), BoxError> {
    let secs = elapsed.as_secs_f64();
    let rows: [(&str, String, &str); 8] = [
        ("total_time", format!("{secs:.3}"), "seconds"),
        ("total_txs", stats.attempted.to_string(), "count"),
        ("succeeded_txs", stats.succeeded.to_string(), "count"),
        ("failed_txs", stats.failed.to_string(), "count"),
        ("total_bytes", stats.bytes.to_string(), "bytes"),
        ("avg_tx_rate", format!("{:.6}", stats.rate(elapsed)), "transactions per second"),
        (
            "avg_data_rate",
            format!("{:.6}", if secs > 0.0 { stats.bytes as f64 / secs } else { 0.0 }),
            "bytes per second",
        ),
        (
            "avg_latency",
            format!(
                "{:.3}",
                stats.latency.mean().unwrap_or_default().as_secs_f64() * 1000.0
            ),
            "milliseconds",
        ),
    ];

    writeln!(w, "Parameter,Value,Units").context("write csv header")?;
    for (param, value, units) in rows {
        writeln!(w, "{param},{value},{units}").context("write csv row")?;
    }
    w.flush().context("flush csv output")?;
    Ok(())
}
