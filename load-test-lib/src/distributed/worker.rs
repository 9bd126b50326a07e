//! Worker: registers with a coordinator, waits for the start command,
//! then drives a local [`Broadcaster`] while streaming its stats back.

use std::{
    fmt,
    path::PathBuf,
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use rama::{
    Layer as _, Service,
    error::{BoxError, ErrorContext as _},
    http::{
        BodyExtractExt as _, HeaderValue, Request, Response, StatusCode, Uri,
        client::EasyHttpWebClient,
        layer::{
            map_request_body::MapRequestBodyLayer,
            required_header::AddRequiredRequestHeadersLayer,
            retry::{ManagedPolicy, RetryLayer},
        },
        service::client::HttpClientExt as _,
    },
    layer::TimeoutLayer,
    rt::Executor,
    service::BoxService,
    telemetry::tracing,
    utils::{backoff::ExponentialBackoff, rng::HasherRng},
};
use serde::{Serialize, de::DeserializeOwned};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::{
    engine::{Broadcaster, RunSummary, Stats, export_summary_csv},
    rpc::Dialer,
    utils::env::network_service_identifier,
};

use super::protocol::{
    Ack, ErrorMessage, PATH_REGISTER, PATH_START, PATH_STATS, RegisterAck, RegisterRequest,
    START_POLL_TIMEOUT, Start, StartPoll, StatsReport, WorkerId,
};

const CONTROL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const REGISTER_RETRY_DELAY: Duration = Duration::from_millis(500);
const FINAL_REPORT_ATTEMPTS: usize = 3;
const FINAL_REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a control request did not get the expected answer.
#[derive(Debug)]
pub enum ControlError {
    /// The coordinator refused the request, e.g. a late registration.
    Rejected(String),
    /// The coordinator no longer knows this worker.
    Gone,
    Transport(BoxError),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(reason) => write!(f, "rejected by coordinator: {reason}"),
            Self::Gone => f.write_str("worker unknown to coordinator"),
            Self::Transport(err) => write!(f, "control channel failure: {err}"),
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err.as_ref()),
            Self::Rejected(_) | Self::Gone => None,
        }
    }
}

/// Client side of the coordinator control protocol.
#[derive(Clone)]
pub struct ControlClient {
    coordinator: Uri,
    base: String,
    inner: BoxService<Request, Response, BoxError>,
}

impl fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlClient")
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

impl ControlClient {
    pub fn new(
        coordinator: Uri,
        inner: impl Service<Request, Output = Response, Error = BoxError>,
    ) -> Self {
        let base = coordinator.to_string().trim_end_matches('/').to_owned();
        Self {
            coordinator,
            base,
            inner: inner.boxed(),
        }
    }

    /// Control client over HTTP(S), retrying transient failures with backoff.
    pub fn try_new_http(coordinator: Uri, exec: Executor) -> Result<Self, BoxError> {
        let web_client = EasyHttpWebClient::connector_builder()
            .with_default_transport_connector()
            .without_tls_proxy_support()
            .without_proxy_support()
            .with_tls_support_using_boringssl(None)
            .with_default_http_connector(exec)
            .try_with_default_connection_pool()
            .context("create connection pool for control web client")?
            .build_client();

        let client = (
            TimeoutLayer::new(CONTROL_REQUEST_TIMEOUT),
            RetryLayer::new(
                ManagedPolicy::default().with_backoff(
                    ExponentialBackoff::new(
                        Duration::from_millis(100),
                        Duration::from_secs(5),
                        0.01,
                        HasherRng::default,
                    )
                    .context("create exponential backoff impl")?,
                ),
            ),
            AddRequiredRequestHeadersLayer::new()
                .with_user_agent_header_value(HeaderValue::from_static(network_service_identifier())),
            MapRequestBodyLayer::new_boxed_streaming_body(),
        )
            .into_layer(web_client);

        Ok(Self::new(coordinator, client))
    }

    pub fn coordinator(&self) -> &Uri {
        &self.coordinator
    }

    pub async fn register(&self, name: &str) -> Result<WorkerId, ControlError> {
        let request = RegisterRequest {
            name: name.to_owned(),
        };
        let ack: RegisterAck = self
            .post(PATH_REGISTER, &request)
            .await?
            .ok_or_else(|| ControlError::Transport("empty register response".into()))?;
        Ok(ack.worker_id)
    }

    /// Long-poll for the start command. `None` means: poll again.
    pub async fn poll_start(&self, worker_id: WorkerId) -> Result<Option<Start>, ControlError> {
        self.post(PATH_START, &StartPoll { worker_id }).await
    }

    pub async fn report(&self, report: &StatsReport) -> Result<Ack, ControlError> {
        self.post(PATH_STATS, report)
            .await?
            .ok_or_else(|| ControlError::Transport("empty stats ack".into()))
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<Option<T>, ControlError>
    where
        B: Serialize + Send + Sync,
        T: DeserializeOwned + Send + 'static,
    {
        let resp = self
            .inner
            .post(format!("{}{path}", self.base))
            .json(body)
            .send()
            .await
            .context("send control request")
            .with_context_field("path", || path.to_owned())
            .map_err(ControlError::Transport)?;

        match resp.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::GONE => Err(ControlError::Gone),
            status if status.is_success() => resp
                .try_into_json()
                .await
                .context("json-decode control response")
                .map(Some)
                .map_err(ControlError::Transport),
            status if status.is_client_error() => {
                let reason = resp
                    .try_into_json::<ErrorMessage>()
                    .await
                    .map(|msg| msg.error)
                    .unwrap_or_else(|_| status.to_string());
                Err(ControlError::Rejected(reason))
            }
            status => Err(ControlError::Transport(BoxError::from(format!(
                "coordinator replied with status {status}"
            )))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name reported at registration.
    pub name: String,
    /// Upper bound for (re)connecting to the coordinator before the run started.
    pub coordinator_connect_timeout: Duration,
    /// Interval of the periodic stats reports.
    pub report_interval: Duration,
    /// Write a CSV summary of the local run here.
    pub stats_output: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct WorkerRun {
    pub worker_id: WorkerId,
    pub load_test_id: String,
    pub summary: RunSummary,
    /// The coordinator acknowledged the terminal report.
    pub final_report_delivered: bool,
}

#[derive(Debug, Clone)]
pub enum WorkerOutcome {
    Completed(Box<WorkerRun>),
    /// Interrupted before the start command arrived.
    Interrupted,
}

pub struct Worker<D> {
    cfg: WorkerConfig,
    control: ControlClient,
    dialer: D,
}

impl<D: fmt::Debug> fmt::Debug for Worker<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("cfg", &self.cfg)
            .field("control", &self.control)
            .field("dialer", &self.dialer)
            .finish()
    }
}

impl<D: Dialer> Worker<D> {
    pub fn new(cfg: WorkerConfig, control: ControlClient, dialer: D) -> Self {
        Self {
            cfg,
            control,
            dialer,
        }
    }

    pub async fn run(
        self,
        cancel: impl Future<Output = ()> + Send,
    ) -> Result<WorkerOutcome, BoxError> {
        let mut cancel = pin!(cancel);

        let (worker_id, start) = tokio::select! {
            result = self.await_start() => result?,
            _ = &mut cancel => {
                tracing::info!("interrupted before the load test started");
                return Ok(WorkerOutcome::Interrupted);
            }
        };

        tracing::info!(
            %worker_id,
            load_test_id = %start.load_test_id,
            start_time_ms = start.start_time_ms,
            connections = start.config.connections,
            rate = start.config.rate,
            duration = ?start.config.duration,
            "start command received: running load test"
        );

        let stats = Arc::new(Stats::new());
        let seq = Arc::new(AtomicU64::new(0));
        let broadcaster = Broadcaster::try_new(start.config, self.dialer.clone(), stats.clone())?
            .with_namespace(worker_id.0);

        let started = Instant::now();
        let reporter = tokio::spawn(report_periodically(
            self.control.clone(),
            worker_id,
            stats.clone(),
            seq.clone(),
            started,
            self.cfg.report_interval,
        ));
        let result = broadcaster.run_until(&mut cancel).await;
        reporter.abort();

        let (elapsed, final_stats) = match &result {
            Ok(summary) => (summary.elapsed, summary.stats),
            Err(_) => (started.elapsed(), stats.snapshot()),
        };
        let final_report_delivered = self
            .deliver_final_report(StatsReport {
                worker_id,
                seq: seq.fetch_add(1, Ordering::Relaxed),
                elapsed_ms: elapsed.as_millis() as u64,
                stats: final_stats,
                terminal: true,
            })
            .await;

        let summary = result?;
        tracing::info!(
            %worker_id,
            end = ?summary.end,
            attempted = summary.stats.attempted,
            succeeded = summary.stats.succeeded,
            failed = summary.stats.failed,
            rate = summary.realized_rate(),
            "local load test finished"
        );

        if let Some(path) = self.cfg.stats_output.as_deref()
            && let Err(err) = export_summary_csv(path, &summary).await
        {
            tracing::error!("failed to export stats summary: {err}");
        }

        Ok(WorkerOutcome::Completed(Box::new(WorkerRun {
            worker_id,
            load_test_id: start.load_test_id,
            summary,
            final_report_delivered,
        })))
    }

    async fn await_start(&self) -> Result<(WorkerId, Start), BoxError> {
        let mut worker_id = self.register().await?;
        let mut control_lost_since: Option<Instant> = None;

        loop {
            match self.control.poll_start(worker_id).await {
                Ok(Some(start)) => return Ok((worker_id, start)),
                Ok(None) => control_lost_since = None,
                Err(ControlError::Gone) => {
                    tracing::warn!(%worker_id, "coordinator dropped our registration: registering again");
                    worker_id = self.register().await?;
                    control_lost_since = None;
                }
                Err(ControlError::Rejected(reason)) => {
                    return Err(BoxError::from(format!(
                        "coordinator rejected start poll: {reason}"
                    )));
                }
                Err(ControlError::Transport(err)) => {
                    let since = *control_lost_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= self.cfg.coordinator_connect_timeout {
                        return Err(err).context("lost connection to coordinator while awaiting start");
                    }
                    tracing::warn!(%worker_id, "start poll failed, retrying: {err}");
                    time::sleep(REGISTER_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn register(&self) -> Result<WorkerId, BoxError> {
        let deadline = Instant::now() + self.cfg.coordinator_connect_timeout;
        loop {
            let err = match time::timeout_at(deadline, self.control.register(&self.cfg.name)).await {
                Ok(Ok(worker_id)) => {
                    tracing::info!(
                        %worker_id,
                        coordinator = %self.control.coordinator(),
                        "registered with coordinator"
                    );
                    return Ok(worker_id);
                }
                Ok(Err(ControlError::Transport(err))) => err,
                Ok(Err(err)) => return Err(err).context("register with coordinator"),
                Err(_) => BoxError::from("register attempt timed out"),
            };

            if Instant::now() + REGISTER_RETRY_DELAY >= deadline {
                return Err(err)
                    .context("could not reach coordinator")
                    .with_context_debug_field("timeout", || self.cfg.coordinator_connect_timeout);
            }
            tracing::debug!("coordinator not reachable yet, retrying: {err}");
            time::sleep(REGISTER_RETRY_DELAY).await;
        }
    }

    async fn deliver_final_report(&self, report: StatsReport) -> bool {
        for attempt in 1..=FINAL_REPORT_ATTEMPTS {
            match time::timeout(FINAL_REPORT_TIMEOUT, self.control.report(&report)).await {
                Ok(Ok(ack)) => {
                    tracing::debug!(applied = ack.applied, "final report delivered");
                    return true;
                }
                Ok(Err(ControlError::Gone)) => {
                    tracing::error!(
                        worker_id = %report.worker_id,
                        "final report not accepted: coordinator declared this worker lost"
                    );
                    return false;
                }
                Ok(Err(err)) => {
                    tracing::warn!(attempt, "final report delivery failed: {err}");
                }
                Err(_) => tracing::warn!(attempt, "final report delivery timed out"),
            }
            if attempt < FINAL_REPORT_ATTEMPTS {
                time::sleep(REGISTER_RETRY_DELAY).await;
            }
        }

        tracing::error!(
            worker_id = %report.worker_id,
            attempted = report.stats.attempted,
            succeeded = report.stats.succeeded,
            failed = report.stats.failed,
            "could not deliver final report to coordinator"
        );
        false
    }
}

async fn report_periodically(
    control: ControlClient,
    worker_id: WorkerId,
    stats: Arc<Stats>,
    seq: Arc<AtomicU64>,
    started: Instant,
    interval: Duration,
) {
    let mut ticker = time::interval_at(started + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut connected = true;

    loop {
        ticker.tick().await;
        let report = StatsReport {
            worker_id,
            seq: seq.fetch_add(1, Ordering::Relaxed),
            elapsed_ms: started.elapsed().as_millis() as u64,
            stats: stats.snapshot(),
            terminal: false,
        };

        match time::timeout(interval.max(START_POLL_TIMEOUT), control.report(&report)).await {
            Ok(Ok(_)) => {
                if !connected {
                    tracing::info!(%worker_id, "control channel restored");
                    connected = true;
                }
            }
            Ok(Err(err)) if connected => {
                tracing::warn!(%worker_id, "stats report failed, continuing load test: {err}");
                connected = false;
            }
            Err(_) if connected => {
                tracing::warn!(%worker_id, "stats report timed out, continuing load test");
                connected = false;
            }
            _ => (),
        }
    }
}
