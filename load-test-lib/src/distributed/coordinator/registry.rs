//! Coordinator state: run state machine plus one handle per registered worker.
//!
//! Pure bookkeeping without I/O. Callers pass in the current time,
//! the HTTP layer guards the registry with a single lock.

use std::{
    collections::BTreeMap,
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use tokio::time::Instant;

use crate::{
    config::LoadTestConfig,
    distributed::protocol::{Ack, Start, StatsReport, WorkerId},
    engine::StatsSnapshot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    AwaitingWorkers,
    Running,
    Finished,
    ShuttingDown,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingWorkers => "awaiting_workers",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::ShuttingDown => "shutting_down",
        }
    }

    /// Numeric value for the state gauge.
    pub fn as_gauge(self) -> u8 {
        match self {
            Self::AwaitingWorkers => 0,
            Self::Running => 1,
            Self::Finished => 2,
            Self::ShuttingDown => 3,
        }
    }

    pub fn is_frozen(self) -> bool {
        matches!(self, Self::Finished | Self::ShuttingDown)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Registered,
    Running,
    Completed,
    Lost,
}

impl WorkerState {
    pub const ALL: [Self; 4] = [Self::Registered, Self::Running, Self::Completed, Self::Lost];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Lost => "lost",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub name: String,
    pub state: WorkerState,
    pub last_seen: Instant,
    /// A start poll of this worker is being held open.
    pub polling: bool,
    pub last_seq: Option<u64>,
    pub elapsed: Duration,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    RunAlreadyStarted,
    UnknownWorker,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunAlreadyStarted => f.write_str("run already started"),
            Self::UnknownWorker => f.write_str("unknown or lost worker"),
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    NotYet,
    Start(Box<Start>),
    Gone,
}

/// Point-in-time view used for the metrics endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub load_test_id: String,
    pub state: RunState,
    pub expected_workers: usize,
    pub workers: Vec<WorkerMetrics>,
    pub total: StatsSnapshot,
    /// Sum of the per-worker realized rates.
    pub rate: f64,
}

impl MetricsSnapshot {
    pub fn count_in_state(&self, state: WorkerState) -> usize {
        self.workers.iter().filter(|w| w.state == state).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerMetrics {
    pub id: WorkerId,
    pub name: String,
    pub state: WorkerState,
    pub elapsed: Duration,
    pub stats: StatsSnapshot,
}

#[derive(Debug)]
pub struct Registry {
    load_test_id: String,
    config: LoadTestConfig,
    expect_workers: usize,
    liveness_timeout: Duration,
    state: RunState,
    next_id: u64,
    workers: BTreeMap<WorkerId, WorkerHandle>,
    start_time_ms: u64,
    frozen: Option<MetricsSnapshot>,
}

impl Registry {
    pub fn new(
        load_test_id: String,
        config: LoadTestConfig,
        expect_workers: usize,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            load_test_id,
            config,
            expect_workers: expect_workers.max(1),
            liveness_timeout,
            state: RunState::AwaitingWorkers,
            next_id: 1,
            workers: BTreeMap::new(),
            start_time_ms: 0,
            frozen: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn worker(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.workers.get(&id)
    }

    /// Number of registered workers that still count towards the quorum.
    pub fn active_workers(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.state != WorkerState::Lost)
            .count()
    }

    /// Register a new worker, starting the run once the quorum is reached.
    pub fn register(&mut self, name: String, now: Instant) -> Result<WorkerId, RegistryError> {
        if self.state != RunState::AwaitingWorkers {
            return Err(RegistryError::RunAlreadyStarted);
        }

        let id = WorkerId(self.next_id);
        self.next_id += 1;
        self.workers.insert(
            id,
            WorkerHandle {
                id,
                name,
                state: WorkerState::Registered,
                last_seen: now,
                polling: false,
                last_seq: None,
                elapsed: Duration::ZERO,
                stats: StatsSnapshot::default(),
            },
        );

        if self.active_workers() >= self.expect_workers {
            self.start();
        }
        Ok(id)
    }

    fn start(&mut self) {
        self.state = RunState::Running;
        self.start_time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        for worker in self.workers.values_mut() {
            if worker.state == WorkerState::Registered {
                worker.state = WorkerState::Running;
            }
        }
    }

    /// Answer a start poll of a worker.
    pub fn poll_start(&mut self, id: WorkerId, now: Instant) -> PollOutcome {
        let Some(worker) = self.workers.get_mut(&id) else {
            return PollOutcome::Gone;
        };
        if worker.state == WorkerState::Lost {
            return PollOutcome::Gone;
        }
        worker.last_seen = now;

        match (self.state, worker.state) {
            (RunState::AwaitingWorkers, _) => PollOutcome::NotYet,
            (RunState::Running, WorkerState::Running) => PollOutcome::Start(Box::new(Start {
                worker_id: id,
                load_test_id: self.load_test_id.clone(),
                config: self.config.clone(),
                start_time_ms: self.start_time_ms,
            })),
            _ => PollOutcome::Gone,
        }
    }

    /// Mark a held start poll as open or closed.
    pub fn set_polling(&mut self, id: WorkerId, polling: bool, now: Instant) {
        if let Some(worker) = self.workers.get_mut(&id) {
            worker.polling = polling;
            worker.last_seen = now;
        }
    }

    /// Apply a stats report, last write wins.
    pub fn apply_report(&mut self, report: &StatsReport, now: Instant) -> Result<Ack, RegistryError> {
        let frozen = self.state.is_frozen();
        let Some(worker) = self.workers.get_mut(&report.worker_id) else {
            return Err(RegistryError::UnknownWorker);
        };
        if worker.state == WorkerState::Lost {
            return Err(RegistryError::UnknownWorker);
        }
        if frozen {
            return Ok(Ack { applied: false });
        }

        worker.last_seen = now;
        if worker.last_seq.is_some_and(|last| report.seq <= last) {
            return Ok(Ack { applied: false });
        }

        worker.last_seq = Some(report.seq);
        worker.stats = report.stats;
        worker.elapsed = Duration::from_millis(report.elapsed_ms);
        if report.terminal {
            worker.state = WorkerState::Completed;
        }
        Ok(Ack { applied: true })
    }

    /// Mark workers silent for longer than the liveness timeout as lost.
    pub fn expire(&mut self, now: Instant) -> Vec<WorkerId> {
        let watched = match self.state {
            RunState::AwaitingWorkers => WorkerState::Registered,
            RunState::Running => WorkerState::Running,
            RunState::Finished | RunState::ShuttingDown => return Vec::new(),
        };

        let mut lost = Vec::new();
        for worker in self.workers.values_mut() {
            if worker.state == watched
                && !worker.polling
                && now.saturating_duration_since(worker.last_seen) > self.liveness_timeout
            {
                worker.state = WorkerState::Lost;
                lost.push(worker.id);
            }
        }
        lost
    }

    /// All workers of a started run either completed or got lost.
    pub fn all_done(&self) -> bool {
        self.state == RunState::Running
            && self
                .workers
                .values()
                .all(|w| matches!(w.state, WorkerState::Completed | WorkerState::Lost))
    }

    /// Freeze the aggregate.
    pub fn finish(&mut self) {
        if self.state.is_frozen() {
            return;
        }
        self.state = RunState::Finished;
        self.frozen = Some(self.compute_snapshot());
    }

    pub fn begin_shutdown(&mut self) {
        self.finish();
        self.state = RunState::ShuttingDown;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        match &self.frozen {
            Some(frozen) => MetricsSnapshot {
                state: self.state,
                ..frozen.clone()
            },
            None => self.compute_snapshot(),
        }
    }

    fn compute_snapshot(&self) -> MetricsSnapshot {
        let workers: Vec<_> = self
            .workers
            .values()
            .map(|w| WorkerMetrics {
                id: w.id,
                name: w.name.clone(),
                state: w.state,
                elapsed: w.elapsed,
                stats: w.stats,
            })
            .collect();

        MetricsSnapshot {
            load_test_id: self.load_test_id.clone(),
            state: self.state,
            expected_workers: self.expect_workers,
            total: workers.iter().map(|w| &w.stats).sum(),
            rate: workers.iter().map(|w| w.stats.rate(w.elapsed)).sum(),
            workers,
        }
    }
}
