//! Standalone mode: a single process drives one [`Broadcaster`] directly.

use std::{path::Path, pin::pin, sync::Arc, time::Duration};

use rama::{error::BoxError, telemetry::tracing};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::{
    config::LoadTestConfig,
    engine::{Broadcaster, Reporter, RunSummary, Stats, export_summary_csv},
    rpc::Dialer,
};

/// How often progress is handed to the [`Reporter`].
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Run a complete load test and report on it.
///
/// Fatal run conditions are returned as a boxed [`crate::engine::RunError`].
pub async fn run<D: Dialer>(
    cancel: impl Future<Output = ()> + Send,
    config: LoadTestConfig,
    dialer: D,
    reporter: &mut dyn Reporter,
    stats_output: Option<&Path>,
) -> Result<RunSummary, BoxError> {
    let stats = Arc::new(Stats::new());
    let broadcaster = Broadcaster::try_new(config, dialer, stats.clone())?;

    let start = Instant::now();
    let mut run = pin!(broadcaster.run_until(cancel));

    let mut progress = time::interval_at(start + PROGRESS_INTERVAL, PROGRESS_INTERVAL);
    progress.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let summary = loop {
        tokio::select! {
            result = &mut run => break result?,
            _ = progress.tick() => reporter.on_tick(start.elapsed(), &stats.snapshot()),
        }
    };

    reporter.finish(&summary);

    if let Some(path) = stats_output
        && let Err(err) = export_summary_csv(path, &summary).await
    {
        tracing::error!("failed to export stats summary: {err}");
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{RunEnd, RunError, StatsSnapshot},
        test::{MockDialer, MockReply, tmp_dir},
    };

    #[derive(Default)]
    struct RecordingReporter {
        ticks: Vec<StatsSnapshot>,
        finished: Option<RunSummary>,
    }

    impl Reporter for RecordingReporter {
        fn on_tick(&mut self, _elapsed: Duration, stats: &StatsSnapshot) {
            self.ticks.push(*stats);
        }

        fn finish(&mut self, summary: &RunSummary) {
            self.finished = Some(summary.clone());
        }
    }

    fn config() -> LoadTestConfig {
        LoadTestConfig {
            connections: 2,
            duration: Duration::from_secs(3),
            rate: 20,
            size: 64,
            endpoints: vec!["http://127.0.0.1:26657".to_owned()],
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_standalone_run_reports_progress_and_summary() {
        time::pause();

        let dir = tmp_dir("standalone_run");
        let csv_path = dir.join("stats.csv");

        let mut reporter = RecordingReporter::default();
        let summary = run(
            std::future::pending(),
            config(),
            MockDialer::default(),
            &mut reporter,
            Some(&csv_path),
        )
        .await
        .unwrap();

        assert_eq!(summary.end, RunEnd::DurationElapsed);
        assert!((2..=3).contains(&reporter.ticks.len()), "{:?}", reporter.ticks);
        for pair in reporter.ticks.windows(2) {
            assert!(pair[1].dominates(&pair[0]));
        }
        assert_eq!(reporter.finished.unwrap().stats, summary.stats);

        let csv = std::fs::read_to_string(csv_path).unwrap();
        assert!(csv.starts_with("Parameter,Value,Units\n"));
        assert!(csv.contains(&format!("total_txs,{},count", summary.stats.attempted)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_standalone_fatal_run() {
        time::pause();

        let mut reporter = RecordingReporter::default();
        let err = run(
            std::future::pending(),
            config(),
            MockDialer::with_behavior(|_| MockReply::Transport),
            &mut reporter,
            None,
        )
        .await
        .unwrap_err();

        let err = err.downcast_ref::<RunError>().unwrap();
        assert!(matches!(err, RunError::AllConnectionsFailed { .. }));
        assert!(reporter.finished.is_none());
    }
}
