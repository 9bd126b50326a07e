use std::{io::Write, time::Duration};

use cmt_load_test_lib::engine::{Reporter, RunSummary, StatsSnapshot};

use super::super::per_second;

/// Emits one JSON object per line, for consumption by other tools.
pub struct JsonlReporter<W> {
    out: W,
    last_elapsed: Duration,
    last: StatsSnapshot,
}

impl<W> JsonlReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            last_elapsed: Duration::ZERO,
            last: StatsSnapshot::default(),
        }
    }
}

impl<W: Write + Send> Reporter for JsonlReporter<W> {
    fn on_tick(&mut self, elapsed: Duration, stats: &StatsSnapshot) {
        let interval = elapsed.saturating_sub(self.last_elapsed);
        let line = serde_json::json!({
            "type": "progress",
            "t_ms": elapsed.as_millis(),
            "tps": per_second(stats.attempted.saturating_sub(self.last.attempted), interval),
            "total": {
                "attempted": stats.attempted,
                "succeeded": stats.succeeded,
                "failed": stats.failed,
                "bytes": stats.bytes,
            },
        });
        let _ = writeln!(self.out, "{line}");

        self.last_elapsed = elapsed;
        self.last = *stats;
    }

    fn finish(&mut self, summary: &RunSummary) {
        let line = serde_json::json!({
            "type": "final",
            "end": summary.end,
            "t_ms": summary.elapsed.as_millis(),
            "target_rate": summary.target_rate,
            "realized_rate": summary.realized_rate(),
            "avg_latency_ms": summary.stats.latency.mean().map(|d| d.as_secs_f64() * 1000.),
            "total": {
                "attempted": summary.stats.attempted,
                "succeeded": summary.stats.succeeded,
                "failed": summary.stats.failed,
                "bytes": summary.stats.bytes,
            },
            "connections": summary.connections,
        });
        let _ = writeln!(self.out, "{line}");
        let _ = self.out.flush();
    }
}
