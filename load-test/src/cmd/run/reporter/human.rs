use std::{io::Write, time::Duration};

use cmt_load_test_lib::engine::{Reporter, RunSummary, StatsSnapshot};

use super::super::per_second;

/// Prints one progress line per tick and a summary table at the end.
pub struct HumanReporter<W> {
    out: W,
    last_elapsed: Duration,
    last: StatsSnapshot,
}

impl<W> HumanReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            last_elapsed: Duration::ZERO,
            last: StatsSnapshot::default(),
        }
    }
}

impl<W: Write + Send> Reporter for HumanReporter<W> {
    fn on_tick(&mut self, elapsed: Duration, stats: &StatsSnapshot) {
        let interval = elapsed.saturating_sub(self.last_elapsed);
        let tps = per_second(stats.attempted.saturating_sub(self.last.attempted), interval);

        let _ = writeln!(
            self.out,
            "t={:.1}s tps={:.1} attempted={} succeeded={} failed={}",
            elapsed.as_secs_f64(),
            tps,
            stats.attempted,
            stats.succeeded,
            stats.failed,
        );

        self.last_elapsed = elapsed;
        self.last = *stats;
    }

    fn finish(&mut self, summary: &RunSummary) {
        let stats = &summary.stats;
        let avg_latency = stats
            .latency
            .mean()
            .map(|latency| format!("{:.1}ms", latency.as_secs_f64() * 1000.))
            .unwrap_or_else(|| "n/a".to_owned());

        let _ = writeln!(
            self.out,
            "\
load test finished ({:?})
  total time:    {:.3}s
  attempted:     {}
  succeeded:     {}
  failed:        {}
  total bytes:   {}
  target rate:   {} tx/s
  realized rate: {:.2} tx/s
  avg latency:   {avg_latency}",
            summary.end,
            summary.elapsed.as_secs_f64(),
            stats.attempted,
            stats.succeeded,
            stats.failed,
            stats.bytes,
            summary.target_rate,
            summary.realized_rate(),
        );
        let _ = self.out.flush();
    }
}
