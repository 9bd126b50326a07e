//! Coordinator: registers workers, starts them in lockstep, aggregates
//! their stats and serves the aggregate as prometheus metrics.

use std::{convert::Infallible, fmt, pin::pin, sync::Arc, time::Duration};

use parking_lot::Mutex;
use rama::{
    Layer as _, Service,
    error::{BoxError, ErrorContext as _},
    graceful::Shutdown,
    http::{
        HeaderValue, Request, Response, StatusCode,
        layer::{required_header::AddRequiredResponseHeadersLayer, trace::TraceLayer},
        server::HttpServer,
        service::web::{
            Router,
            extract::State,
            response::{IntoResponse, Json},
        },
    },
    net::{address::SocketAddress, socket::Interface},
    rt::Executor,
    tcp::server::TcpListener,
    telemetry::tracing,
};
use tokio::{
    sync::{Notify, oneshot, watch},
    time::{self, Instant},
};

use crate::{config::LoadTestConfig, utils::env::network_service_identifier};

use super::protocol::{
    ErrorMessage, PATH_METRICS, PATH_PING, PATH_REGISTER, PATH_START, PATH_STATS,
    RegisterAck, RegisterRequest, START_POLL_TIMEOUT, StartPoll, StatsReport,
};

mod metrics;
mod registry;

pub use self::{
    metrics::render as render_metrics,
    registry::{
        MetricsSnapshot, PollOutcome, Registry, RegistryError, RunState, WorkerHandle,
        WorkerMetrics, WorkerState,
    },
};

const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_millis(250);
/// Bounds the server stop after shutdown-wait, idle keep-alive connections included.
const SERVER_SHUTDOWN_LIMIT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub bind: Interface,
    /// Number of workers required before the run starts.
    pub expect_workers: usize,
    /// Startup deadline for reaching the worker quorum.
    pub worker_connect_timeout: Duration,
    /// Silence after which a worker is considered lost.
    pub liveness_timeout: Duration,
    /// How long the frozen metrics stay available after the run finished.
    pub shutdown_wait: Duration,
    pub load_test_id: String,
    pub load_test: LoadTestConfig,
}

#[derive(Debug)]
pub enum CoordinatorError {
    WorkersUnavailable {
        registered: usize,
        expected: usize,
        timeout: Duration,
    },
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkersUnavailable {
                registered,
                expected,
                timeout,
            } => write!(
                f,
                "only {registered} of {expected} expected worker(s) registered within {timeout:?}"
            ),
        }
    }
}

impl std::error::Error for CoordinatorError {}

#[derive(Debug, Clone)]
pub struct CoordinatorOutcome {
    /// Frozen aggregate of the run.
    pub metrics: MetricsSnapshot,
    /// The run was cut short by an operator interrupt.
    pub interrupted: bool,
}

/// Registry plus change notifications.
///
/// `state_tx` wakes long-polling handlers on run state changes,
/// `updated` wakes the run loop on any mutation.
#[derive(Debug, Clone)]
struct SharedRegistry {
    registry: Arc<Mutex<Registry>>,
    state_tx: Arc<watch::Sender<RunState>>,
    updated: Arc<Notify>,
}

impl SharedRegistry {
    fn new(registry: Registry) -> Self {
        let (state_tx, _) = watch::channel(registry.state());
        Self {
            registry: Arc::new(Mutex::new(registry)),
            state_tx: Arc::new(state_tx),
            updated: Arc::new(Notify::new()),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Registry) -> T) -> T {
        let registry = self.registry.lock();
        f(&*registry)
    }

    /// Mutate the registry and publish any run state change.
    fn update<T>(&self, f: impl FnOnce(&mut Registry) -> T) -> T {
        let mut registry = self.registry.lock();
        let output = f(&mut registry);
        let state = registry.state();
        drop(registry);

        self.state_tx.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
        self.updated.notify_one();
        output
    }

    fn snapshot(&self) -> MetricsSnapshot {
        self.registry.lock().snapshot()
    }

    fn state(&self) -> RunState {
        *self.state_tx.borrow()
    }
}

pub struct Coordinator {
    cfg: CoordinatorConfig,
    shared: SharedRegistry,
    local_addr: SocketAddress,
    server: Shutdown,
    stop_server: oneshot::Sender<()>,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("cfg", &self.cfg)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl Coordinator {
    /// Bind the control and metrics http server and start accepting workers.
    pub async fn bind(cfg: CoordinatorConfig) -> Result<Self, BoxError> {
        cfg.load_test
            .validate()
            .context("validate load test config")?;

        let registry = Registry::new(
            cfg.load_test_id.clone(),
            cfg.load_test.clone(),
            cfg.expect_workers,
            cfg.liveness_timeout,
        );
        let shared = SharedRegistry::new(registry);

        let (stop_server, stop_rx) = oneshot::channel::<()>();
        let server = Shutdown::new(async move {
            let _ = stop_rx.await;
        });
        let exec = Executor::graceful(server.guard());

        let http_svc = (
            TraceLayer::new_for_http(),
            AddRequiredResponseHeadersLayer::new()
                .with_server_header_value(HeaderValue::from_static(network_service_identifier())),
        )
            .into_layer(control_router(shared.clone()));
        let http_server = HttpServer::auto(exec.clone()).service(Arc::new(http_svc));

        let tcp_listener = TcpListener::bind(cfg.bind.clone(), exec.clone())
            .await
            .context("bind coordinator http server")
            .with_context_debug_field("interface", || cfg.bind.clone())?;
        let local_addr: SocketAddress = tcp_listener
            .local_addr()
            .context("get bound address for coordinator http server")?
            .into();

        tracing::info!(
            %local_addr,
            expect_workers = cfg.expect_workers,
            load_test_id = %cfg.load_test_id,
            "coordinator http server bound"
        );

        exec.spawn_task(async move {
            tcp_listener.serve(http_server).await;
        });

        Ok(Self {
            cfg,
            shared,
            local_addr,
            server,
            stop_server,
        })
    }

    pub fn local_addr(&self) -> SocketAddress {
        self.local_addr
    }

    pub fn state(&self) -> RunState {
        self.shared.state()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.snapshot()
    }

    /// Drive the run to completion.
    ///
    /// `cancel` is the operator interrupt. The http server is stopped
    /// before returning, whatever the outcome.
    pub async fn run(
        self,
        cancel: impl Future<Output = ()> + Send,
    ) -> Result<CoordinatorOutcome, BoxError> {
        let Self {
            cfg,
            shared,
            server,
            stop_server,
            ..
        } = self;

        let mut cancel = pin!(cancel);
        let result = RunLoop { cfg, shared }.drive(&mut cancel).await;

        let _ = stop_server.send(());
        match server.shutdown_with_limit(SERVER_SHUTDOWN_LIMIT).await {
            Ok(delay) => tracing::debug!("coordinator http server stopped after {delay:?}"),
            Err(err) => tracing::warn!("coordinator http server did not stop in time: {err}"),
        }

        result
    }
}

struct RunLoop {
    cfg: CoordinatorConfig,
    shared: SharedRegistry,
}

impl RunLoop {
    async fn drive(
        self,
        cancel: &mut (impl Future<Output = ()> + Send + Unpin),
    ) -> Result<CoordinatorOutcome, BoxError> {
        let mut state_rx = self.shared.state_tx.subscribe();
        let mut liveness = time::interval(LIVENESS_CHECK_INTERVAL);
        let deadline = Instant::now() + self.cfg.worker_connect_timeout;

        tracing::info!(
            expect_workers = self.cfg.expect_workers,
            timeout = ?self.cfg.worker_connect_timeout,
            "awaiting workers"
        );
        while self.shared.state() == RunState::AwaitingWorkers {
            tokio::select! {
                _ = time::sleep_until(deadline) => {
                    let registered = self.shared.read(|reg| reg.active_workers());
                    return Err(CoordinatorError::WorkersUnavailable {
                        registered,
                        expected: self.cfg.expect_workers,
                        timeout: self.cfg.worker_connect_timeout,
                    }
                    .into());
                }
                _ = &mut *cancel => {
                    tracing::warn!("interrupted before the load test started");
                    let metrics = self.shared.update(|reg| {
                        reg.begin_shutdown();
                        reg.snapshot()
                    });
                    return Ok(CoordinatorOutcome {
                        metrics,
                        interrupted: true,
                    });
                }
                _ = state_rx.changed() => (),
                _ = liveness.tick() => self.expire_workers(),
            }
        }

        tracing::info!(
            workers = self.shared.read(|reg| reg.active_workers()),
            "worker quorum reached: load test running"
        );

        let mut interrupted = false;
        while !self.shared.read(|reg| reg.all_done()) {
            tokio::select! {
                _ = &mut *cancel => {
                    tracing::warn!("interrupted while running: finishing load test early");
                    interrupted = true;
                    break;
                }
                _ = self.shared.updated.notified() => (),
                _ = liveness.tick() => self.expire_workers(),
            }
        }

        let metrics = self.shared.update(|reg| {
            reg.finish();
            reg.snapshot()
        });
        tracing::info!(
            attempted = metrics.total.attempted,
            succeeded = metrics.total.succeeded,
            failed = metrics.total.failed,
            rate = metrics.rate,
            lost_workers = metrics.count_in_state(WorkerState::Lost),
            "load test finished"
        );

        self.shared.update(|reg| reg.begin_shutdown());
        if !interrupted {
            tracing::info!(wait = ?self.cfg.shutdown_wait, "serving final metrics before shutdown");
            tokio::select! {
                _ = time::sleep(self.cfg.shutdown_wait) => (),
                _ = &mut *cancel => tracing::info!("interrupted during shutdown wait"),
            }
        }

        Ok(CoordinatorOutcome {
            metrics,
            interrupted,
        })
    }

    fn expire_workers(&self) {
        let lost = self.shared.update(|reg| reg.expire(Instant::now()));
        for worker_id in lost {
            tracing::warn!(%worker_id, "worker lost: no sign of life within liveness timeout");
        }
    }
}

fn control_router(
    shared: SharedRegistry,
) -> impl Service<Request, Output = Response, Error = Infallible> {
    Router::new_with_state(shared)
        .with_post(PATH_REGISTER, register)
        .with_post(PATH_START, poll_start)
        .with_post(PATH_STATS, report_stats)
        .with_get(PATH_METRICS, metrics)
        .with_get(PATH_PING, "pong")
}

async fn register(
    State(shared): State<SharedRegistry>,
    Json(request): Json<RegisterRequest>,
) -> impl IntoResponse {
    let name = request.name.clone();
    match shared.update(|reg| reg.register(request.name, Instant::now())) {
        Ok(worker_id) => {
            tracing::info!(%worker_id, %name, "worker registered");
            Json(RegisterAck { worker_id }).into_response()
        }
        Err(err) => {
            tracing::warn!(%name, "rejected worker registration: {err}");
            (StatusCode::CONFLICT, Json(ErrorMessage::new(err.to_string()))).into_response()
        }
    }
}

async fn poll_start(
    State(shared): State<SharedRegistry>,
    Json(StartPoll { worker_id }): Json<StartPoll>,
) -> impl IntoResponse {
    let outcome = match shared.update(|reg| reg.poll_start(worker_id, Instant::now())) {
        PollOutcome::NotYet => {
            let mut state_rx = shared.state_tx.subscribe();
            shared.update(|reg| reg.set_polling(worker_id, true, Instant::now()));
            let _ = time::timeout(
                START_POLL_TIMEOUT,
                state_rx.wait_for(|state| *state != RunState::AwaitingWorkers),
            )
            .await;
            shared.update(|reg| {
                reg.set_polling(worker_id, false, Instant::now());
                reg.poll_start(worker_id, Instant::now())
            })
        }
        outcome => outcome,
    };

    match outcome {
        PollOutcome::Start(start) => {
            tracing::debug!(%worker_id, "start command delivered");
            Json(*start).into_response()
        }
        PollOutcome::NotYet => StatusCode::NO_CONTENT.into_response(),
        PollOutcome::Gone => (
            StatusCode::GONE,
            Json(ErrorMessage::new(RegistryError::UnknownWorker.to_string())),
        )
            .into_response(),
    }
}

async fn report_stats(
    State(shared): State<SharedRegistry>,
    Json(report): Json<StatsReport>,
) -> impl IntoResponse {
    match shared.update(|reg| reg.apply_report(&report, Instant::now())) {
        Ok(ack) => {
            if report.terminal {
                tracing::info!(
                    worker_id = %report.worker_id,
                    attempted = report.stats.attempted,
                    applied = ack.applied,
                    "final worker report received"
                );
            }
            Json(ack).into_response()
        }
        Err(err) => {
            tracing::debug!(worker_id = %report.worker_id, "rejected stats report: {err}");
            (StatusCode::GONE, Json(ErrorMessage::new(err.to_string()))).into_response()
        }
    }
}

async fn metrics(State(shared): State<SharedRegistry>) -> impl IntoResponse {
    match render_metrics(&shared.snapshot()) {
        Ok(text) => text.into_response(),
        Err(err) => {
            tracing::error!("failed to render metrics: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
