use std::{path::Path, time::Duration};

use rama::{
    error::{BoxError, ErrorContext as _},
    telemetry::tracing,
};

use super::{
    broadcaster::RunSummary,
    stats::{StatsSnapshot, write_summary_csv},
};

/// Receives progress of a running load test.
pub trait Reporter: Send {
    /// Called periodically while the load test runs.
    fn on_tick(&mut self, elapsed: Duration, stats: &StatsSnapshot);

    /// Called once with the final summary of a completed run.
    fn finish(&mut self, summary: &RunSummary);
}

/// [`Reporter`] which only logs.
#[derive(Debug, Clone, Default)]
pub struct TracingReporter {
    last: StatsSnapshot,
}

impl Reporter for TracingReporter {
    fn on_tick(&mut self, elapsed: Duration, stats: &StatsSnapshot) {
        let delta = stats.attempted.saturating_sub(self.last.attempted);
        self.last = *stats;
        tracing::info!(
            elapsed = ?elapsed,
            attempted = stats.attempted,
            succeeded = stats.succeeded,
            failed = stats.failed,
            tx_per_tick = delta,
            "load test progress"
        );
    }

    fn finish(&mut self, summary: &RunSummary) {
        tracing::info!(
            elapsed = ?summary.elapsed,
            attempted = summary.stats.attempted,
            succeeded = summary.stats.succeeded,
            failed = summary.stats.failed,
            realized_rate = summary.realized_rate(),
            "load test summary"
        );
    }
}

/// Write the summary of a finished run as CSV to the given file.
pub async fn export_summary_csv(path: &Path, summary: &RunSummary) -> Result<(), BoxError> {
    let mut csv = Vec::new();
    write_summary_csv(&mut csv, summary.elapsed, &summary.stats)?;
    tokio::fs::write(path, csv)
        .await
        .context("write stats output")
        .with_context_debug_field("path", || path.to_owned())?;
    tracing::info!(path = %path.display(), "stats summary written");
    Ok(())
}
