//! In-process fake CometBFT RPC endpoints for engine and orchestration tests.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use parking_lot::Mutex;
use rama::{
    error::{BoxError, ErrorContext as _},
    http::{
        BodyExtractExt as _, Method, Request, Response, Uri,
        service::web::response::{IntoResponse as _, Json},
    },
    service::service_fn,
};
use serde_json::json;

use crate::rpc::{Dialer, RpcClient};

/// A single broadcast as seen by the mock endpoint.
#[derive(Debug, Clone)]
pub(crate) struct MockCall {
    pub endpoint: String,
    /// Which dial (0-based, across all endpoints) the submitting client came from.
    pub dial: usize,
    /// Transaction index decoded from the payload.
    pub index: u64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum MockReply {
    Accept,
    Reject(i64),
    Transport,
    Delay(Duration),
}

type Behavior = Box<dyn Fn(&MockCall) -> MockReply + Send + Sync>;

#[derive(Clone)]
pub(crate) struct MockDialer {
    inner: Arc<Inner>,
}

struct Inner {
    behavior: Behavior,
    reachable: AtomicBool,
    unreachable_endpoints: Mutex<HashSet<String>>,
    dials: AtomicUsize,
    peers: AtomicUsize,
    calls: Mutex<Vec<MockCall>>,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl Default for MockDialer {
    fn default() -> Self {
        Self::with_behavior(|_| MockReply::Accept)
    }
}

impl MockDialer {
    pub(crate) fn with_behavior(
        behavior: impl Fn(&MockCall) -> MockReply + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                behavior: Box::new(behavior),
                reachable: AtomicBool::new(true),
                unreachable_endpoints: Mutex::new(HashSet::new()),
                dials: AtomicUsize::new(0),
                peers: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            }),
        }
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    pub(crate) fn set_endpoint_unreachable(&self, endpoint: &str) {
        self.inner
            .unreachable_endpoints
            .lock()
            .insert(endpoint.to_owned());
    }

    pub(crate) fn set_peers(&self, peers: usize) {
        self.inner.peers.store(peers, Ordering::SeqCst);
    }

    pub(crate) fn dial_count(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent.load(Ordering::SeqCst)
    }

    pub(crate) fn call_count(&self) -> usize {
        self.inner.calls.lock().len()
    }

    /// Indices submitted through the client of the given dial, in arrival order.
    pub(crate) fn submitted_indices(&self, dial: usize) -> Vec<u64> {
        self.inner
            .calls
            .lock()
            .iter()
            .filter(|call| call.dial == dial)
            .map(|call| call.index)
            .collect()
    }

    /// Indices grouped per dial, in arrival order.
    pub(crate) fn indices_per_dial(&self) -> BTreeMap<usize, Vec<u64>> {
        let mut per_dial: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
        for call in self.inner.calls.lock().iter() {
            per_dial.entry(call.dial).or_default().push(call.index);
        }
        per_dial
    }

    pub(crate) fn calls_per_endpoint(&self) -> BTreeMap<String, usize> {
        let mut per_endpoint = BTreeMap::new();
        for call in self.inner.calls.lock().iter() {
            *per_endpoint.entry(call.endpoint.clone()).or_default() += 1;
        }
        per_endpoint
    }
}

impl Dialer for MockDialer {
    async fn dial(&self, endpoint: &Uri) -> Result<RpcClient, BoxError> {
        let endpoint_str = endpoint.to_string();
        if !self.inner.reachable.load(Ordering::SeqCst)
            || self
                .inner
                .unreachable_endpoints
                .lock()
                .contains(&endpoint_str)
        {
            return Err(BoxError::from(format!(
                "mock endpoint {endpoint_str} unreachable"
            )));
        }

        let dial = self.inner.dials.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.clone();
        let svc = service_fn(move |req: Request| {
            let inner = inner.clone();
            let endpoint = endpoint_str.clone();
            async move { inner.serve(endpoint, dial, req).await }
        });

        let client = RpcClient::new(endpoint.clone(), svc);
        client.health().await?;
        Ok(client)
    }
}

impl Inner {
    async fn serve(&self, endpoint: String, dial: usize, req: Request) -> Result<Response, BoxError> {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        match (method, path.as_str()) {
            (Method::GET, "/health") => {
                Ok(Json(json!({"jsonrpc": "2.0", "id": -1, "result": {}})).into_response())
            }
            (Method::GET, "/net_info") => Ok(Json(json!({
                "jsonrpc": "2.0",
                "id": -1,
                "result": {
                    "listening": true,
                    "n_peers": self.peers.load(Ordering::SeqCst).to_string(),
                },
            }))
            .into_response()),
            (Method::POST, _) => self.broadcast(endpoint, dial, req).await,
            _ => Err(BoxError::from("unexpected mock request")),
        }
    }

    async fn broadcast(
        &self,
        endpoint: String,
        dial: usize,
        req: Request,
    ) -> Result<Response, BoxError> {
        let body: serde_json::Value = req.try_into_json().await.context("decode json-rpc request")?;
        let tx = body["params"]["tx"]
            .as_str()
            .context("json-rpc request without tx param")?;
        let payload = STANDARD.decode(tx).context("base64-decode tx")?;

        let call = MockCall {
            endpoint,
            dial,
            index: decode_index(&payload),
        };
        let reply = (self.behavior)(&call);
        self.calls.lock().push(call);

        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        let result = match reply {
            MockReply::Accept => Ok(accepted()),
            MockReply::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(accepted())
            }
            MockReply::Reject(code) => Ok(Json(json!({
                "jsonrpc": "2.0",
                "id": body["id"],
                "error": {"code": code, "message": "mock rejection", "data": ""},
            }))
            .into_response()),
            MockReply::Transport => Err(BoxError::from("mock transport failure")),
        };

        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn accepted() -> Response {
    Json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": {
            "code": 0,
            "log": "",
            "hash": "00",
            "check_tx": {"code": 0},
            "tx_result": {"code": 0},
            "height": "1",
        },
    }))
    .into_response()
}

/// kvstore payloads carry the index as hex in their key,
/// other payloads start with it as big endian bytes.
fn decode_index(payload: &[u8]) -> u64 {
    if payload.len() > 32
        && payload[32] == b'='
        && let Ok(hex_index) = std::str::from_utf8(&payload[16..32])
        && let Ok(index) = u64::from_str_radix(hex_index, 16)
    {
        return index;
    }
    payload
        .get(..8)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u64::from_be_bytes)
        .unwrap_or_default()
}

/// Fresh directory for test artifacts, left behind for inspection.
pub(crate) fn tmp_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir()
        .join(crate::utils::env::project_name())
        .join(format!("{name}-{:016x}", rand::random::<u64>()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Plain HTTP client for talking to servers bound by the test itself.
pub(crate) fn web_client() -> impl rama::Service<Request, Output = Response, Error = BoxError> {
    use rama::{
        Layer as _,
        http::{client::EasyHttpWebClient, layer::map_request_body::MapRequestBodyLayer},
        layer::TimeoutLayer,
        rt::Executor,
    };

    let client = EasyHttpWebClient::connector_builder()
        .with_default_transport_connector()
        .without_tls_proxy_support()
        .without_proxy_support()
        .with_tls_support_using_boringssl(None)
        .with_default_http_connector(Executor::default())
        .try_with_default_connection_pool()
        .expect("create connection pool for test web client")
        .build_client();

    (
        TimeoutLayer::new(Duration::from_secs(30)),
        MapRequestBodyLayer::new_boxed_streaming_body(),
    )
        .into_layer(client)
}
