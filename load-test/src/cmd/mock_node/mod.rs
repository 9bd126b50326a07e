use std::{
    convert::Infallible,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use rama::{
    Layer as _, Service,
    error::{BoxError, ErrorContext as _},
    graceful::ShutdownGuard,
    http::{
        BodyExtractExt as _, HeaderValue, Method, Request, Response, StatusCode,
        headers::ContentType,
        layer::{required_header::AddRequiredResponseHeadersLayer, trace::TraceLayer},
        server::HttpServer,
        service::web::response::{Headers, IntoResponse, Json},
    },
    layer::TimeoutLayer,
    net::socket::Interface,
    rt::Executor,
    tcp::server::TcpListener,
    telemetry::tracing,
};

use clap::Args;
use cmt_load_test_lib::utils::env;
use serde_json::{Value, json};

use crate::server::write_server_socket_address_as_file;

#[derive(Debug, Clone, Args)]
/// run a fake CometBFT RPC node, accepting every well-formed transaction
pub struct MockNodeCommand {
    /// network interface to bind to
    #[arg(
        long,
        short = 'b',
        value_name = "INTERFACE",
        default_value = "127.0.0.1:0"
    )]
    pub bind: Interface,

    /// base latency added to every broadcast
    #[arg(long, value_name = "SECONDS", default_value_t = 0.)]
    pub base_latency: f64,

    /// random extra latency in [-jitter, +jitter]
    #[arg(long, value_name = "SECONDS", default_value_t = 0.)]
    pub jitter: f64,

    /// ratio of broadcasts rejected with a json-rpc error
    #[arg(long, value_name = "RATIO", default_value_t = 0.)]
    pub error_rate: f32,

    /// ratio of broadcasts answered with 408 Request Timeout
    #[arg(long, value_name = "RATIO", default_value_t = 0.)]
    pub timeout_rate: f32,

    /// number of peers reported by `/net_info`
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub peers: usize,
}

pub async fn exec(data: PathBuf, guard: ShutdownGuard, args: MockNodeCommand) -> Result<(), BoxError> {
    let exec = Executor::graceful(guard);
    let tcp_listener = TcpListener::bind(args.bind.clone(), exec.clone())
        .await
        .context("bind mock node http server")?;

    let http_svc = (
        TraceLayer::new_for_http(),
        AddRequiredResponseHeadersLayer::new()
            .with_server_header_value(HeaderValue::from_static(env::network_service_identifier())),
    )
        .into_layer(Arc::new(MockNode::try_new(&args)?));

    let http_server = HttpServer::auto(exec).service(Arc::new(http_svc));
    let tcp_svc = TimeoutLayer::new(Duration::from_secs(60)).into_layer(http_server);

    let server_addr = tcp_listener
        .local_addr()
        .context("get bound address for mock node http server")?;
    tracing::info!(address = %server_addr, "mock node ready");
    write_server_socket_address_as_file(&data, "mock-node", server_addr.into()).await?;

    tcp_listener.serve(tcp_svc).await;

    Ok(())
}

#[derive(Debug)]
struct MockNode {
    base_latency: f64,
    jitter: f64,
    error_rate: f32,
    timeout_rate: f32,
    peers: usize,
    accepted_txs: AtomicU64,
    next_height: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockOutcome {
    Timeout,
    Error,
    Ok,
}

impl MockNode {
    fn try_new(args: &MockNodeCommand) -> Result<Self, BoxError> {
        if args.error_rate + args.timeout_rate > 1. {
            return Err(BoxError::from("timeout_rate + error_rate must be <= 1.0"));
        }

        Ok(Self {
            base_latency: args.base_latency,
            jitter: args.jitter,
            error_rate: args.error_rate,
            timeout_rate: args.timeout_rate,
            peers: args.peers,
            accepted_txs: AtomicU64::new(0),
            next_height: AtomicU64::new(1),
        })
    }

    fn pick_outcome(&self) -> MockOutcome {
        let timeout_rate = self.timeout_rate.clamp(0., 1.);
        let error_rate = self.error_rate.clamp(0., 1.);

        let r: f32 = rand::random();
        if r < timeout_rate {
            MockOutcome::Timeout
        } else if r < timeout_rate + error_rate {
            MockOutcome::Error
        } else {
            MockOutcome::Ok
        }
    }

    fn compute_delay(&self) -> Duration {
        let base = self.base_latency.max(0.0);
        let jitter = self.jitter.max(0.0);

        if jitter == 0.0 {
            return Duration::from_secs_f64(base);
        }

        let u: f64 = rand::random();
        let delta = (u * jitter * 2.0) - jitter;
        Duration::from_secs_f64((base + delta).max(0.0))
    }

    async fn broadcast(&self, req: Request) -> Response {
        let body: Value = match req.try_into_json().await {
            Ok(body) => body,
            Err(err) => {
                tracing::debug!("invalid json-rpc request: {err}");
                return rpc_error(Value::Null, -32700, "Parse error", &err.to_string());
            }
        };
        let id = body["id"].clone();

        let method = body["method"].as_str().unwrap_or_default();
        if !matches!(
            method,
            "broadcast_tx_async" | "broadcast_tx_sync" | "broadcast_tx_commit"
        ) {
            return rpc_error(id, -32601, "Method not found", method);
        }

        let tx = match body["params"]["tx"].as_str().map(|tx| STANDARD.decode(tx)) {
            Some(Ok(tx)) if !tx.is_empty() => tx,
            _ => return rpc_error(id, -32602, "Invalid params", "tx must be non-empty base64"),
        };

        let delay = self.compute_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match self.pick_outcome() {
            MockOutcome::Timeout => StatusCode::REQUEST_TIMEOUT.into_response(),
            MockOutcome::Error => rpc_error(id, -32603, "Internal error", "mempool is full"),
            MockOutcome::Ok => {
                self.accepted_txs.fetch_add(1, Ordering::Relaxed);
                let hash = format!("{:016X}", tx_hash(&tx));
                let result = match method {
                    "broadcast_tx_commit" => json!({
                        "check_tx": {"code": 0, "log": ""},
                        "tx_result": {"code": 0, "log": ""},
                        "hash": hash,
                        "height": self.next_height.fetch_add(1, Ordering::Relaxed).to_string(),
                    }),
                    _ => json!({"code": 0, "data": "", "log": "", "codespace": "", "hash": hash}),
                };
                Json(json!({"jsonrpc": "2.0", "id": id, "result": result})).into_response()
            }
        }
    }
}

impl Service<Request> for MockNode {
    type Output = Response;
    type Error = Infallible;

    async fn serve(&self, req: Request) -> Result<Self::Output, Self::Error> {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        Ok(match (method, path.as_str()) {
            (Method::GET, "/health") => {
                Json(json!({"jsonrpc": "2.0", "id": -1, "result": {}})).into_response()
            }
            (Method::GET, "/net_info") => Json(json!({
                "jsonrpc": "2.0",
                "id": -1,
                "result": {
                    "listening": true,
                    "listeners": [],
                    "n_peers": self.peers.to_string(),
                    "peers": [],
                },
            }))
            .into_response(),
            (Method::GET, "/counter/txs") => (
                Headers::single(ContentType::text_utf8()),
                self.accepted_txs.load(Ordering::Relaxed).to_string(),
            )
                .into_response(),
            (Method::POST, "/") => self.broadcast(req).await,
            _ => StatusCode::NOT_FOUND.into_response(),
        })
    }
}

fn rpc_error(id: Value, code: i64, message: &str, data: &str) -> Response {
    Json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message, "data": data},
    }))
    .into_response()
}

/// Stand-in for a transaction hash: FNV-1a over the payload.
fn tx_hash(tx: &[u8]) -> u64 {
    tx.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}
