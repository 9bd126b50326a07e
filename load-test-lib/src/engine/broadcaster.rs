use std::{fmt, pin::pin, sync::Arc, time::Duration};

use rama::{error::BoxError, http::Uri, telemetry::tracing};
use serde::Serialize;
use tokio::{
    task::JoinSet,
    time::{self, Instant},
};

use crate::{
    config::LoadTestConfig,
    rpc::Dialer,
    tx::{ClientFactory, TxSourceFactory, source_seed},
};

use super::{
    connection::{Connection, ConnectionReport},
    pacer::{Pacer, RateGate},
    stats::{Stats, StatsSnapshot},
};

/// Relative rate divergence above which a warning is logged
/// when no explicit threshold is configured.
const RATE_DEVIATION_WARN: f64 = 0.1;

/// Why a run ended without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEnd {
    DurationElapsed,
    CountReached,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub elapsed: Duration,
    pub target_rate: u64,
    pub stats: StatsSnapshot,
    pub end: RunEnd,
    pub connections: Vec<ConnectionReport>,
}

impl RunSummary {
    pub fn realized_rate(&self) -> f64 {
        self.stats.rate(self.elapsed)
    }
}

/// Fatal run conditions.
#[derive(Debug)]
pub enum RunError {
    InvalidConfig(BoxError),
    PeersUnavailable {
        expected: usize,
        seen: Option<usize>,
        timeout: Duration,
    },
    NoReachableEndpoints {
        endpoints: usize,
    },
    AllConnectionsFailed {
        connections: usize,
        stats: StatsSnapshot,
    },
    RateDeviation {
        target: u64,
        realized: f64,
        allowed: f64,
    },
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(err) => write!(f, "invalid load test config: {err}"),
            Self::PeersUnavailable {
                expected,
                seen,
                timeout,
            } => match seen {
                Some(seen) => write!(
                    f,
                    "endpoint reported {seen} peers after {timeout:?}, expected at least {expected}"
                ),
                None => write!(
                    f,
                    "failed to query endpoint peers within {timeout:?} (expected at least {expected})"
                ),
            },
            Self::NoReachableEndpoints { endpoints } => {
                write!(f, "none of the {endpoints} endpoint(s) could be reached")
            }
            Self::AllConnectionsFailed { connections, .. } => {
                write!(f, "all {connections} connection(s) failed")
            }
            Self::RateDeviation {
                target,
                realized,
                allowed,
            } => write!(
                f,
                "realized rate {realized:.2} tx/s deviates from target {target} tx/s by more than {:.1}%",
                allowed * 100.0
            ),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidConfig(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Owns the connection pool of a single run and drives it at the target rate.
pub struct Broadcaster<D> {
    config: LoadTestConfig,
    endpoints: Vec<Uri>,
    dialer: D,
    stats: Arc<Stats>,
    namespace: u64,
    source_factory: Arc<dyn TxSourceFactory>,
}

impl<D: fmt::Debug> fmt::Debug for Broadcaster<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("config", &self.config)
            .field("endpoints", &self.endpoints)
            .field("dialer", &self.dialer)
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl<D: Dialer> Broadcaster<D> {
    pub fn try_new(config: LoadTestConfig, dialer: D, stats: Arc<Stats>) -> Result<Self, RunError> {
        config.validate().map_err(RunError::InvalidConfig)?;
        let endpoints = config
            .selected_endpoints()
            .map_err(RunError::InvalidConfig)?;
        let factory =
            ClientFactory::from_name(&config.client_factory).map_err(RunError::InvalidConfig)?;

        let dialer = dialer.with_request_timeout(config.request_timeout);
        Ok(Self {
            config,
            endpoints,
            dialer,
            stats,
            namespace: 0,
            source_factory: Arc::new(factory),
        })
    }

    /// Namespace mixed into the payload seeds,
    /// so that distinct workers never produce the same transactions.
    pub fn with_namespace(mut self, namespace: u64) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_source_factory(mut self, factory: impl TxSourceFactory) -> Self {
        self.source_factory = Arc::new(factory);
        self
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Run the load test until its duration elapsed, its transaction budget
    /// is used up, or `cancel` resolves.
    pub async fn run_until(
        self,
        cancel: impl Future<Output = ()> + Send,
    ) -> Result<RunSummary, RunError> {
        let mut cancel = pin!(cancel);

        if let Some(expected) = self.config.expect_peers {
            tokio::select! {
                result = self.wait_for_peers(expected) => result?,
                _ = &mut cancel => {
                    tracing::info!("load test cancelled while waiting for peers");
                    return Ok(self.summary(Duration::ZERO, RunEnd::Cancelled, Vec::new()));
                }
            }
        }

        let connections = tokio::select! {
            connections = self.open_connections() => connections?,
            _ = &mut cancel => {
                tracing::info!("load test cancelled while connecting");
                return Ok(self.summary(Duration::ZERO, RunEnd::Cancelled, Vec::new()));
            }
        };
        let connection_count = connections.len();

        tracing::info!(
            connections = connection_count,
            endpoints = self.endpoints.len(),
            rate = self.config.rate,
            duration = ?self.config.duration,
            size = self.config.size,
            method = %self.config.broadcast_method,
            "load test started"
        );

        let start = Instant::now();
        let deadline = start + self.config.duration;

        let gate = RateGate::new();
        let pacer = tokio::spawn(
            Pacer::new(
                gate.clone(),
                self.config.rate,
                self.config.send_period,
                self.config.count,
                self.stats.clone(),
            )
            .run(),
        );

        let mut lanes = JoinSet::new();
        for connection in connections {
            lanes.spawn(connection.run(gate.clone()));
        }

        let mut reports = Vec::with_capacity(connection_count);
        let end = loop {
            tokio::select! {
                _ = time::sleep_until(deadline) => break RunEnd::DurationElapsed,
                _ = &mut cancel => {
                    tracing::info!("load test cancelled");
                    break RunEnd::Cancelled;
                }
                joined = lanes.join_next() => match joined {
                    Some(report) => collect_report(&mut reports, report),
                    // lanes only stop by themselves when out of tokens or retired
                    None => break RunEnd::CountReached,
                },
            }
        };

        gate.close();
        while let Some(report) = lanes.join_next().await {
            collect_report(&mut reports, report);
        }
        pacer.abort();

        let elapsed = start.elapsed();
        reports.sort_by_key(|report| report.index);

        if !reports.is_empty() && reports.iter().all(|report| report.retired) {
            return Err(RunError::AllConnectionsFailed {
                connections: reports.len(),
                stats: self.stats.snapshot(),
            });
        }

        let summary = self.summary(elapsed, end, reports);
        self.check_rate(&summary)?;

        tracing::info!(
            elapsed = ?summary.elapsed,
            attempted = summary.stats.attempted,
            succeeded = summary.stats.succeeded,
            failed = summary.stats.failed,
            realized_rate = summary.realized_rate(),
            end = ?summary.end,
            "load test finished"
        );
        Ok(summary)
    }

    async fn wait_for_peers(&self, expected: usize) -> Result<(), RunError> {
        let timeout = self.config.peer_connect_timeout;
        let Some(endpoint) = self.endpoints.first() else {
            return Err(RunError::NoReachableEndpoints { endpoints: 0 });
        };

        tracing::info!(%endpoint, expected, ?timeout, "waiting for endpoint peers");

        let mut seen = None;
        let poll = async {
            loop {
                match self.dialer.dial(endpoint).await {
                    Ok(client) => match client.net_info_peers().await {
                        Ok(peers) if peers >= expected => return,
                        Ok(peers) => {
                            tracing::debug!(peers, expected, "not enough peers yet");
                            seen = Some(peers);
                        }
                        Err(err) => tracing::debug!("failed to query peers: {err}"),
                    },
                    Err(err) => tracing::debug!("failed to reach endpoint for peer query: {err}"),
                }
                time::sleep(Duration::from_secs(1)).await;
            }
        };

        let result = time::timeout(timeout, poll).await;
        match result {
            Ok(()) => Ok(()),
            Err(_) => Err(RunError::PeersUnavailable {
                expected,
                seen,
                timeout,
            }),
        }
    }

    async fn open_connections(&self) -> Result<Vec<Connection<D>>, RunError> {
        let mut opening = JoinSet::new();
        for index in 0..self.config.connections {
            let endpoint = self.endpoints[index % self.endpoints.len()].clone();
            let source = self.source_factory.new_source(
                source_seed(self.config.tx_seed, self.namespace, index),
                self.config.size,
            );
            opening.spawn(Connection::open(
                index,
                endpoint,
                self.dialer.clone(),
                source,
                self.config.broadcast_method,
                self.stats.clone(),
            ));
        }

        let mut connections = Vec::with_capacity(self.config.connections);
        while let Some(joined) = opening.join_next().await {
            match joined {
                Ok(Ok(connection)) => connections.push(connection),
                Ok(Err(err)) => tracing::warn!("failed to open connection: {err}"),
                Err(err) => tracing::error!("connection open task failed: {err}"),
            }
        }

        if connections.is_empty() {
            return Err(RunError::NoReachableEndpoints {
                endpoints: self.endpoints.len(),
            });
        }
        if connections.len() < self.config.connections {
            tracing::warn!(
                opened = connections.len(),
                requested = self.config.connections,
                "continuing with fewer connections than requested"
            );
        }
        Ok(connections)
    }

    fn summary(&self, elapsed: Duration, end: RunEnd, connections: Vec<ConnectionReport>) -> RunSummary {
        RunSummary {
            elapsed,
            target_rate: self.config.rate,
            stats: self.stats.snapshot(),
            end,
            connections,
        }
    }

    fn check_rate(&self, summary: &RunSummary) -> Result<(), RunError> {
        if summary.end != RunEnd::DurationElapsed {
            return Ok(());
        }

        let target = self.config.rate;
        let realized = summary.realized_rate();
        let deviation = (realized - target as f64).abs() / target as f64;

        match self.config.max_rate_deviation {
            Some(allowed) if deviation > allowed => Err(RunError::RateDeviation {
                target,
                realized,
                allowed,
            }),
            None if deviation > RATE_DEVIATION_WARN => {
                tracing::warn!(
                    target,
                    realized,
                    tokens_granted = summary.stats.tokens_granted,
                    attempted = summary.stats.attempted,
                    in_flight = summary.stats.in_flight,
                    "realized rate diverges from target rate"
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn collect_report(
    reports: &mut Vec<ConnectionReport>,
    joined: Result<ConnectionReport, tokio::task::JoinError>,
) {
    match joined {
        Ok(report) => reports.push(report),
        Err(err) => tracing::error!("connection lane task failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::BroadcastMethod,
        test::{MockDialer, MockReply},
    };

    fn config(rate: u64, duration: Duration) -> LoadTestConfig {
        LoadTestConfig {
            client_factory: "random".to_owned(),
            connections: 1,
            duration,
            rate,
            size: 8,
            endpoints: vec!["http://node-a:26657".to_owned()],
            ..Default::default()
        }
    }

    async fn run(
        config: LoadTestConfig,
        dialer: MockDialer,
    ) -> Result<RunSummary, RunError> {
        Broadcaster::try_new(config, dialer, Arc::new(Stats::new()))
            .unwrap()
            .run_until(std::future::pending())
            .await
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_fire_and_forget_single_connection_scenario() {
        time::pause();

        let cfg = LoadTestConfig {
            size: 1,
            ..config(10, Duration::from_secs(2))
        };
        let summary = run(cfg, MockDialer::default()).await.unwrap();

        assert_eq!(summary.end, RunEnd::DurationElapsed);
        assert!(
            (19..=21).contains(&summary.stats.attempted),
            "attempted: {}",
            summary.stats.attempted
        );
        assert_eq!(summary.stats.succeeded, summary.stats.attempted);
        assert_eq!(summary.stats.failed, 0);
        assert!(summary.stats.is_consistent());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_round_robin_over_endpoints() {
        time::pause();

        let dialer = MockDialer::default();
        let cfg = LoadTestConfig {
            connections: 4,
            endpoints: vec![
                "http://node-a:26657".to_owned(),
                "http://node-b:26657".to_owned(),
            ],
            ..config(200, Duration::from_secs(1))
        };
        let summary = run(cfg, dialer.clone()).await.unwrap();

        assert_eq!(summary.connections.len(), 4);
        for report in &summary.connections {
            let expected = if report.index % 2 == 0 { "node-a" } else { "node-b" };
            assert!(report.endpoint.contains(expected), "{report:?}");
        }

        let per_endpoint = dialer.calls_per_endpoint();
        assert_eq!(per_endpoint.len(), 2);
        let total: usize = per_endpoint.values().sum();
        assert_eq!(total as u64, summary.stats.attempted);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_per_connection_indices_are_gap_free() {
        time::pause();

        let dialer = MockDialer::default();
        let cfg = LoadTestConfig {
            connections: 3,
            ..config(300, Duration::from_secs(1))
        };
        let summary = run(cfg, dialer.clone()).await.unwrap();

        let per_dial = dialer.indices_per_dial();
        assert_eq!(per_dial.len(), 3);
        for (dial, indices) in per_dial {
            let expected: Vec<u64> = (0..indices.len() as u64).collect();
            assert_eq!(indices, expected, "dial {dial}");
        }
        let issued: u64 = summary.connections.iter().map(|r| r.issued).sum();
        assert_eq!(issued, summary.stats.attempted);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_count_ends_run_early() {
        time::pause();

        let cfg = LoadTestConfig {
            count: Some(15),
            connections: 2,
            ..config(100, Duration::from_secs(60))
        };
        let summary = run(cfg, MockDialer::default()).await.unwrap();

        assert_eq!(summary.end, RunEnd::CountReached);
        assert_eq!(summary.stats.attempted, 15);
        assert!(summary.elapsed < Duration::from_secs(1));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_cancel_stops_sending() {
        time::pause();

        let dialer = MockDialer::default();
        let summary = Broadcaster::try_new(
            config(10, Duration::from_secs(60)),
            dialer.clone(),
            Arc::new(Stats::new()),
        )
        .unwrap()
        .run_until(time::sleep(Duration::from_millis(550)))
        .await
        .unwrap();

        assert_eq!(summary.end, RunEnd::Cancelled);
        assert!((5..=7).contains(&summary.stats.attempted));

        let calls = dialer.call_count();
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(dialer.call_count(), calls);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_all_connections_failed_is_fatal() {
        time::pause();

        let cfg = LoadTestConfig {
            connections: 2,
            ..config(10, Duration::from_secs(5))
        };
        let err = run(cfg, MockDialer::with_behavior(|_| MockReply::Transport))
            .await
            .unwrap_err();

        match err {
            RunError::AllConnectionsFailed { connections, stats } => {
                assert_eq!(connections, 2);
                assert!(stats.is_consistent());
                assert_eq!(stats.succeeded, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_surviving_connections_keep_running() {
        time::pause();

        let cfg = LoadTestConfig {
            connections: 2,
            endpoints: vec![
                "http://node-a:26657".to_owned(),
                "http://node-b:26657".to_owned(),
            ],
            ..config(20, Duration::from_secs(2))
        };
        let dialer = MockDialer::with_behavior(|call| {
            if call.endpoint.contains("node-b") {
                MockReply::Transport
            } else {
                MockReply::Accept
            }
        });
        let summary = run(cfg, dialer).await.unwrap();

        let retired: Vec<_> = summary.connections.iter().filter(|r| r.retired).collect();
        assert_eq!(retired.len(), 1);
        assert!(retired[0].endpoint.contains("node-b"));
        assert!(summary.stats.succeeded >= 35);
        assert!(summary.stats.is_consistent());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_no_reachable_endpoints_is_fatal() {
        let dialer = MockDialer::default();
        dialer.set_reachable(false);

        let err = run(config(10, Duration::from_secs(1)), dialer)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::NoReachableEndpoints { endpoints: 1 }));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_partially_reachable_endpoints() {
        time::pause();

        let dialer = MockDialer::default();
        dialer.set_endpoint_unreachable("http://node-b:26657/");
        let cfg = LoadTestConfig {
            connections: 2,
            endpoints: vec![
                "http://node-a:26657".to_owned(),
                "http://node-b:26657".to_owned(),
            ],
            ..config(10, Duration::from_secs(1))
        };
        let summary = run(cfg, dialer).await.unwrap();
        assert_eq!(summary.connections.len(), 1);
        assert!(summary.stats.attempted > 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_rate_deviation_threshold() {
        time::pause();

        let slow = || MockDialer::with_behavior(|_| MockReply::Delay(Duration::from_secs(1)));
        let cfg = LoadTestConfig {
            broadcast_method: BroadcastMethod::Commit,
            ..config(100, Duration::from_secs(3))
        };

        // without threshold the divergence is only logged
        run(cfg.clone(), slow()).await.unwrap();

        let err = run(
            LoadTestConfig {
                max_rate_deviation: Some(0.5),
                ..cfg
            },
            slow(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RunError::RateDeviation { target: 100, .. }));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_expect_peers() {
        time::pause();

        let dialer = MockDialer::default();
        let cfg = LoadTestConfig {
            expect_peers: Some(2),
            peer_connect_timeout: Duration::from_secs(5),
            ..config(10, Duration::from_secs(1))
        };

        dialer.set_peers(1);
        let err = run(cfg.clone(), dialer.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            RunError::PeersUnavailable {
                expected: 2,
                seen: Some(1),
                ..
            }
        ));

        dialer.set_peers(3);
        let summary = run(cfg, dialer).await.unwrap();
        assert_eq!(summary.end, RunEnd::DurationElapsed);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = Broadcaster::try_new(
            LoadTestConfig::default(),
            MockDialer::default(),
            Arc::new(Stats::new()),
        )
        .unwrap_err();
        assert!(matches!(err, RunError::InvalidConfig(_)));
    }
}
