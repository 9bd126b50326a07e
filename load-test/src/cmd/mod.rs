use std::time::Duration;

use clap::Args;
use cmt_load_test_lib::config::{BroadcastMethod, LoadTestConfig, parse_duration};

pub mod coordinator;
pub mod mock_node;
pub mod run;
pub mod worker;

/// Load test parameters shared by the standalone run and the coordinator.
#[derive(Debug, Clone, Args)]
pub struct LoadTestArgs {
    /// Comma separated list of RPC endpoints (http(s)://, ws(s)://... or host:port)
    #[arg(long, short = 'e', value_name = "URL,...", value_delimiter = ',')]
    pub endpoints: Vec<String>,

    /// Number of connections to open, spread round-robin over the endpoints
    #[arg(long, short = 'c', value_name = "N", default_value_t = 1)]
    pub connections: usize,

    /// Duration of the load test, in seconds or as e.g. `1m30s`
    #[arg(long, short = 'T', value_name = "DURATION", value_parser = parse_duration, default_value = "60")]
    pub duration: Duration,

    /// Target aggregate transaction rate (tx/s)
    #[arg(long, short = 'r', value_name = "TX/S", default_value_t = 1000)]
    pub rate: u64,

    /// Size of every transaction in bytes.
    ///
    /// The kvstore factory needs at least 40 bytes. Use
    /// `--client-factory random` for smaller transactions.
    #[arg(long, short = 's', value_name = "BYTES", default_value_t = 250)]
    pub size: usize,

    /// Stop after this many transactions (unlimited when unset)
    #[arg(long, short = 'N', value_name = "N")]
    pub count: Option<u64>,

    /// Interval at which send permissions are handed out
    #[arg(long, short = 'p', value_name = "DURATION", value_parser = parse_duration, default_value = "100ms")]
    pub send_period: Duration,

    /// RPC method used to broadcast transactions
    #[arg(
        long = "broadcast-tx-method",
        value_name = "async | sync | commit",
        default_value = "async"
    )]
    pub broadcast_method: BroadcastMethod,

    /// Transaction source (kvstore | random)
    #[arg(long, value_name = "NAME", default_value = "kvstore")]
    pub client_factory: String,

    /// Use at most this many of the supplied endpoints
    #[arg(long, value_name = "N")]
    pub max_endpoints: Option<usize>,

    /// Before starting, wait for the first endpoint to report at least this many peers
    #[arg(long, value_name = "N")]
    pub expect_peers: Option<usize>,

    /// How long to wait for the expected peers
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, default_value = "600")]
    pub peer_connect_timeout: Duration,

    /// Timeout of a single RPC request
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, default_value = "10")]
    pub request_timeout: Duration,

    /// Fail the run when the realized rate deviates more than this fraction from the target
    #[arg(long, value_name = "FRACTION")]
    pub max_rate_deviation: Option<f64>,

    /// Seed of the transaction sources (random when unset)
    #[arg(long, value_name = "SEED")]
    pub tx_seed: Option<u64>,
}

impl LoadTestArgs {
    pub fn into_config(self) -> LoadTestConfig {
        LoadTestConfig {
            client_factory: self.client_factory,
            connections: self.connections,
            duration: self.duration,
            send_period: self.send_period,
            rate: self.rate,
            size: self.size,
            count: self.count,
            broadcast_method: self.broadcast_method,
            endpoints: self.endpoints,
            max_endpoints: self.max_endpoints,
            expect_peers: self.expect_peers,
            peer_connect_timeout: self.peer_connect_timeout,
            request_timeout: self.request_timeout,
            max_rate_deviation: self.max_rate_deviation,
            tx_seed: self.tx_seed.unwrap_or_else(rand::random),
        }
    }
}
