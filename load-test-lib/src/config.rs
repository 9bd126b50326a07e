//! Load test run parameters.
//!
//! A [`LoadTestConfig`] is created once at the start of a run,
//! either from the command line or as received by a worker from
//! its coordinator, and is never mutated afterwards.

use std::{fmt, str::FromStr, time::Duration};

use rama::{
    error::{BoxError, ErrorContext as _},
    http::Uri,
};

use serde::{Deserialize, Serialize};

use crate::tx::ClientFactory;

/// How much endpoint confirmation is awaited
/// before a submission is counted as successful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastMethod {
    /// Fire-and-forget: success once the endpoint took the request.
    #[default]
    Async,
    /// Wait until the transaction is accepted into the mempool.
    Sync,
    /// Wait until the transaction is included in a committed block.
    Commit,
}

impl BroadcastMethod {
    /// CometBFT JSON-RPC method name.
    pub fn rpc_method(self) -> &'static str {
        match self {
            Self::Async => "broadcast_tx_async",
            Self::Sync => "broadcast_tx_sync",
            Self::Commit => "broadcast_tx_commit",
        }
    }

    /// Maximum number of unacknowledged submissions per connection.
    pub fn max_in_flight(self) -> usize {
        match self {
            Self::Async => 16,
            Self::Sync => 4,
            Self::Commit => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Async => "async",
            Self::Sync => "sync",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for BroadcastMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BroadcastMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "async" | "fire-and-forget" => Ok(Self::Async),
            "sync" | "wait-accepted" => Ok(Self::Sync),
            "commit" | "wait-committed" => Ok(Self::Commit),
            other => Err(format!(
                "unknown broadcast method '{other}' (expected one of: async, sync, commit)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTestConfig {
    /// Name of the transaction source (see [`ClientFactory`]).
    pub client_factory: String,
    /// Number of connections (lanes) to open, spread over the endpoints.
    pub connections: usize,
    /// How long the load test runs.
    pub duration: Duration,
    /// Pacing interval of the rate controller.
    pub send_period: Duration,
    /// Target aggregate rate in transactions per second.
    pub rate: u64,
    /// Size of every transaction payload in bytes.
    pub size: usize,
    /// Stop after this many transactions, if defined.
    pub count: Option<u64>,
    pub broadcast_method: BroadcastMethod,
    /// Ordered list of RPC endpoints.
    pub endpoints: Vec<String>,
    /// Use at most this many of the supplied endpoints.
    pub max_endpoints: Option<usize>,
    /// Wait until the first endpoint reports at least this many peers.
    pub expect_peers: Option<usize>,
    pub peer_connect_timeout: Duration,
    /// Per-submission timeout.
    pub request_timeout: Duration,
    /// Fraction by which the realized rate may deviate from the target
    /// before the run is considered failed. Unset means: log only.
    pub max_rate_deviation: Option<f64>,
    /// Seed mixed into every transaction source.
    pub tx_seed: u64,
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self {
            client_factory: ClientFactory::KvStore.name().to_owned(),
            connections: 1,
            duration: Duration::from_secs(60),
            send_period: Duration::from_millis(100),
            rate: 1000,
            size: 250,
            count: None,
            broadcast_method: BroadcastMethod::Async,
            endpoints: Vec::new(),
            max_endpoints: None,
            expect_peers: None,
            peer_connect_timeout: Duration::from_secs(600),
            request_timeout: Duration::from_secs(10),
            max_rate_deviation: None,
            tx_seed: 0,
        }
    }
}

impl LoadTestConfig {
    pub fn validate(&self) -> Result<(), BoxError> {
        if self.connections == 0 {
            return Err(BoxError::from("at least one connection is required"));
        }
        if self.rate == 0 {
            return Err(BoxError::from("rate must be at least 1 tx/s"));
        }
        if self.duration.is_zero() {
            return Err(BoxError::from("duration must be greater than zero"));
        }
        if self.send_period.is_zero() || self.send_period > Duration::from_secs(1) {
            return Err(BoxError::from(
                "send period must be greater than zero and at most one second",
            ));
        }
        if self.count == Some(0) {
            return Err(BoxError::from("count must be at least 1 when defined"));
        }
        if self.max_endpoints == Some(0) {
            return Err(BoxError::from("max endpoints must be at least 1 when defined"));
        }
        if let Some(deviation) = self.max_rate_deviation
            && !(0.0..=1.0).contains(&deviation)
        {
            return Err(BoxError::from(
                "max rate deviation must be a fraction between 0.0 and 1.0",
            ));
        }

        let factory = ClientFactory::from_name(&self.client_factory)?;
        if self.size < factory.min_tx_size() {
            return Err(BoxError::from(format!(
                "transaction size {} is below the minimum of {} bytes for client factory '{}'",
                self.size,
                factory.min_tx_size(),
                factory.name(),
            )));
        }

        let _ = self.selected_endpoints()?;
        Ok(())
    }

    /// The endpoints to use for this run, normalised to http(s) base uris.
    pub fn selected_endpoints(&self) -> Result<Vec<Uri>, BoxError> {
        if self.endpoints.is_empty() {
            return Err(BoxError::from("no endpoints configured"));
        }

        let limit = self.max_endpoints.unwrap_or(usize::MAX);
        self.endpoints
            .iter()
            .take(limit)
            .map(|raw| {
                normalize_endpoint(raw)
                    .context("parse endpoint")
                    .with_context_field("endpoint", || raw.clone())
            })
            .collect()
    }

    /// Total number of transactions a perfect run would send.
    pub fn expected_tx_count(&self) -> u64 {
        let by_time = (self.rate as f64 * self.duration.as_secs_f64()).round() as u64;
        match self.count {
            Some(count) => count.min(by_time),
            None => by_time,
        }
    }
}

/// Turn a user supplied endpoint into an http(s) base uri.
///
/// WebSocket endpoints (`ws://host:26657/websocket`) are accepted
/// and mapped onto the http endpoint of the same node.
pub fn normalize_endpoint(raw: &str) -> Result<Uri, BoxError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(BoxError::from("empty endpoint"));
    }

    let with_scheme = if raw.contains("://") {
        raw.to_owned()
    } else {
        format!("http://{raw}")
    };

    let uri: Uri = with_scheme.parse().context("invalid endpoint uri")?;

    let scheme = match uri.scheme_str() {
        Some("http") | Some("ws") => "http",
        Some("https") | Some("wss") => "https",
        Some(other) => {
            return Err(BoxError::from(format!(
                "unsupported endpoint scheme '{other}'"
            )));
        }
        None => "http",
    };

    let authority = uri
        .authority()
        .context("endpoint uri has no authority (host[:port])")?;

    let path = uri.path().trim_end_matches('/');
    let path = path.strip_suffix("/websocket").unwrap_or(path);

    format!("{scheme}://{authority}{path}")
        .parse()
        .context("build normalised endpoint uri")
}

/// Parse a duration given either as (fractional) seconds or in humantime format.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if let Ok(secs) = input.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|err| err.to_string());
    }
    humantime::parse_duration(input).map_err(|err| err.to_string())
}
