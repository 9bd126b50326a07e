//! Load generation engine: connection pool, rate controller and statistics.

mod broadcaster;
mod connection;
mod pacer;
mod reporter;
mod stats;

pub use self::{
    broadcaster::{Broadcaster, RunEnd, RunError, RunSummary},
    connection::ConnectionReport,
    reporter::{Reporter, TracingReporter, export_summary_csv},
    stats::{LATENCY_BUCKETS_MS, LatencySnapshot, Stats, StatsSnapshot, write_summary_csv},
};
