//! Prometheus exposition of a [`MetricsSnapshot`].
//!
//! A fresh [`Registry`] is filled from the snapshot on every scrape,
//! so the output only ever reflects that snapshot.

use prometheus::{
    Encoder as _, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder, core::Collector, proto,
};
use rama::error::{BoxError, ErrorContext as _};

use crate::engine::{LATENCY_BUCKETS_MS, LatencySnapshot};

use super::registry::{MetricsSnapshot, RunState, WorkerState};

const LOAD_TEST_ID: &str = "load_test_id";

/// Render the snapshot in the prometheus text format.
///
/// Families and series come out sorted, so rendering the same
/// snapshot twice yields identical output.
pub fn render(snapshot: &MetricsSnapshot) -> Result<String, BoxError> {
    let registry = Registry::new();
    let id = snapshot.load_test_id.as_str();
    let opts = |name: &str, help: &str| Opts::new(name, help).const_label(LOAD_TEST_ID, id);

    let coordinator_state = register(
        &registry,
        IntGaugeVec::new(opts("loadtest_coordinator_state", "Current coordinator run state"), &["state"])?,
    )?;
    for state in [
        RunState::AwaitingWorkers,
        RunState::Running,
        RunState::Finished,
        RunState::ShuttingDown,
    ] {
        coordinator_state
            .with_label_values(&[state.as_str()])
            .set(i64::from(state == snapshot.state));
    }

    let total = &snapshot.total;
    for (name, help, value) in [
        ("loadtest_tx_attempted_total", "Transactions submitted", total.attempted),
        ("loadtest_tx_succeeded_total", "Transactions confirmed by an endpoint", total.succeeded),
        ("loadtest_tx_failed_total", "Transactions that failed or were rejected", total.failed),
        ("loadtest_tx_bytes_total", "Payload bytes of succeeded transactions", total.bytes),
        ("loadtest_tx_tokens_granted_total", "Send permissions granted by the rate pacers", total.tokens_granted),
    ] {
        register(&registry, IntCounter::with_opts(opts(name, help))?)?.inc_by(value);
    }

    register(
        &registry,
        IntGauge::with_opts(opts("loadtest_tx_in_flight", "Transactions issued but not yet settled"))?,
    )?
    .set(i64::try_from(total.in_flight).unwrap_or(i64::MAX));

    register(
        &registry,
        Gauge::with_opts(opts("loadtest_tx_rate", "Aggregate realized transaction rate (tx/s)"))?,
    )?
    .set(snapshot.rate);

    let workers = register(
        &registry,
        IntGaugeVec::new(opts("loadtest_workers", "Number of workers per state"), &["state"])?,
    )?;
    for state in WorkerState::ALL {
        workers
            .with_label_values(&[state.as_str()])
            .set(gauge_value(snapshot.count_in_state(state)));
    }

    register(
        &registry,
        IntGauge::with_opts(opts("loadtest_workers_registered", "Number of workers that ever registered"))?,
    )?
    .set(gauge_value(snapshot.workers.len()));
    register(
        &registry,
        IntGauge::with_opts(opts("loadtest_workers_expected", "Number of workers required to start"))?,
    )?
    .set(gauge_value(snapshot.expected_workers));

    register_workers(&registry, snapshot, opts)?;

    let mut families = registry.gather();
    families.push(latency_family(id, &total.latency));

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&families, &mut buffer)
        .context("encode prometheus metrics")?;
    String::from_utf8(buffer).context("prometheus text output is not utf-8")
}

fn register_workers(
    registry: &Registry,
    snapshot: &MetricsSnapshot,
    opts: impl Fn(&str, &str) -> Opts,
) -> Result<(), BoxError> {
    let worker_state = register(
        registry,
        IntGaugeVec::new(
            opts("loadtest_worker_state", "Lifecycle state per worker"),
            &["worker_id", "name", "state"],
        )?,
    )?;
    let attempted = register(
        registry,
        IntCounterVec::new(
            opts("loadtest_worker_tx_attempted_total", "Transactions submitted per worker"),
            &["worker_id"],
        )?,
    )?;
    let succeeded = register(
        registry,
        IntCounterVec::new(
            opts("loadtest_worker_tx_succeeded_total", "Transactions confirmed per worker"),
            &["worker_id"],
        )?,
    )?;
    let failed = register(
        registry,
        IntCounterVec::new(
            opts("loadtest_worker_tx_failed_total", "Transactions failed per worker"),
            &["worker_id"],
        )?,
    )?;

    for worker in &snapshot.workers {
        let worker_id = worker.id.to_string();
        worker_state
            .with_label_values(&[worker_id.as_str(), worker.name.as_str(), worker.state.as_str()])
            .set(1);
        attempted
            .with_label_values(&[worker_id.as_str()])
            .inc_by(worker.stats.attempted);
        succeeded
            .with_label_values(&[worker_id.as_str()])
            .inc_by(worker.stats.succeeded);
        failed
            .with_label_values(&[worker_id.as_str()])
            .inc_by(worker.stats.failed);
    }
    Ok(())
}

fn register<C>(registry: &Registry, collector: C) -> Result<C, BoxError>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .context("register prometheus collector")?;
    Ok(collector)
}

fn gauge_value(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// The latency histogram arrives pre-bucketed from the workers,
/// so its family is assembled directly instead of observed.
fn latency_family(id: &str, latency: &LatencySnapshot) -> proto::MetricFamily {
    let mut histogram = proto::Histogram::default();
    histogram.set_sample_count(latency.count);
    histogram.set_sample_sum(latency.sum_us as f64 / 1_000_000.0);

    let mut cumulative = 0;
    for (upper_ms, count) in LATENCY_BUCKETS_MS.iter().zip(latency.buckets) {
        cumulative += count;
        let mut bucket = proto::Bucket::default();
        bucket.set_cumulative_count(cumulative);
        bucket.set_upper_bound(*upper_ms as f64 / 1000.0);
        histogram.mut_bucket().push(bucket);
    }

    let mut label = proto::LabelPair::default();
    label.set_name(LOAD_TEST_ID.to_owned());
    label.set_value(id.to_owned());

    let mut metric = proto::Metric::default();
    metric.mut_label().push(label);
    metric.set_histogram(histogram);

    let mut family = proto::MetricFamily::default();
    family.set_name("loadtest_tx_latency_seconds".to_owned());
    family.set_help("Latency of succeeded transactions".to_owned());
    family.set_field_type(proto::MetricType::HISTOGRAM);
    family.mut_metric().push(metric);
    family
}
