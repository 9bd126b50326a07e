//! Coordinator control protocol, JSON over HTTP.
//!
//! | route            | request          | responses                          |
//! |------------------|------------------|------------------------------------|
//! | `POST /v1/register` | [`RegisterRequest`] | 200 [`RegisterAck`], 409 run already started |
//! | `POST /v1/start`    | [`StartPoll`]       | 200 [`Start`], 204 poll again, 410 unknown worker |
//! | `POST /v1/stats`    | [`StatsReport`]     | 200 [`Ack`], 410 unknown worker |
//! | `GET /metrics`      |                     | 200 prometheus text |
//! | `GET /ping`         |                     | 200 `pong` |

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{config::LoadTestConfig, engine::StatsSnapshot};

pub const PATH_REGISTER: &str = "/v1/register";
pub const PATH_START: &str = "/v1/start";
pub const PATH_STATS: &str = "/v1/stats";
pub const PATH_METRICS: &str = "/metrics";
pub const PATH_PING: &str = "/ping";

/// How long the coordinator holds a start poll open before answering 204.
pub const START_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Coordinator assigned worker identity.
///
/// Never reused within a coordinator lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Human readable worker name, not required to be unique.
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartPoll {
    pub worker_id: WorkerId,
}

/// Start command, identical for every worker apart from `worker_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Start {
    pub worker_id: WorkerId,
    pub load_test_id: String,
    pub config: LoadTestConfig,
    /// Logical start time: unix epoch milliseconds on the coordinator clock.
    pub start_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsReport {
    pub worker_id: WorkerId,
    /// Strictly increasing per worker; stale reports are ignored.
    pub seq: u64,
    pub elapsed_ms: u64,
    pub stats: StatsSnapshot,
    /// Last report of this worker for the run.
    pub terminal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ack {
    /// Whether the report changed the coordinator's view.
    pub applied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error: String,
}

impl ErrorMessage {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
