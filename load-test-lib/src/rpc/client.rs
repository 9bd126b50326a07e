use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use rama::{
    Service,
    error::{BoxError, ErrorContext as _},
    http::{BodyExtractExt as _, Request, Response, Uri, service::client::HttpClientExt as _},
    service::BoxService,
};

use crate::config::BroadcastMethod;

use super::jsonrpc::{AbciResult, CommitResult, NetInfoResult, RpcRequest, RpcResponse};

/// Why a single submission did not succeed.
#[derive(Debug)]
pub enum SubmitError {
    /// The endpoint could not be reached or replied with garbage.
    ///
    /// Recovered from by reconnecting.
    Transport(BoxError),
    /// The endpoint answered but refused the transaction.
    Rejected { code: i64, log: String },
}

impl SubmitError {
    pub fn transport(err: impl Into<BoxError>) -> Self {
        Self::Transport(err.into())
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "transport failure: {err}"),
            Self::Rejected { code, log } => write!(f, "rejected (code {code}): {log}"),
        }
    }
}

impl std::error::Error for SubmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err.as_ref()),
            Self::Rejected { .. } => None,
        }
    }
}

/// Client for a single CometBFT RPC endpoint.
#[derive(Clone)]
pub struct RpcClient {
    endpoint: Uri,
    base: String,
    inner: BoxService<Request, Response, BoxError>,
    next_id: Arc<AtomicU64>,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl RpcClient {
    pub fn new(
        endpoint: Uri,
        inner: impl Service<Request, Output = Response, Error = BoxError>,
    ) -> Self {
        let base = endpoint.to_string().trim_end_matches('/').to_owned();
        Self {
            endpoint,
            base,
            inner: inner.boxed(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }

    /// Check the `/health` route of the endpoint.
    pub async fn health(&self) -> Result<(), BoxError> {
        let resp = self
            .inner
            .get(format!("{}/health", self.base))
            .send()
            .await
            .context("check endpoint health")
            .with_context_field("endpoint", || self.endpoint.clone())?;

        if !resp.status().is_success() {
            return Err(BoxError::from(format!(
                "endpoint {} reported unhealthy status {}",
                self.endpoint,
                resp.status()
            )));
        }
        Ok(())
    }

    /// Number of peers the node behind this endpoint is connected to.
    pub async fn net_info_peers(&self) -> Result<usize, BoxError> {
        let resp: RpcResponse = self
            .inner
            .get(format!("{}/net_info", self.base))
            .send()
            .await
            .context("fetch net info")
            .with_context_field("endpoint", || self.endpoint.clone())?
            .try_into_json()
            .await
            .context("json-decode net info response")?;

        if let Some(err) = resp.error {
            return Err(BoxError::from(format!(
                "net_info failed (code {}): {}",
                err.code,
                err.describe()
            )));
        }

        let info: NetInfoResult = serde_json::from_value(
            resp.result.context("net_info response without result")?,
        )
        .context("decode net_info result")?;

        info.n_peers
            .trim()
            .parse()
            .context("parse n_peers")
            .with_context_field("n_peers", || info.n_peers.clone())
    }

    /// Submit a single transaction and wait for the confirmation
    /// level required by the given broadcast method.
    pub async fn broadcast_tx(&self, method: BroadcastMethod, tx: &[u8]) -> Result<(), SubmitError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::broadcast_tx(id, method.rpc_method(), tx);

        let resp = self
            .inner
            .post(format!("{}/", self.base))
            .json(&request)
            .send()
            .await
            .map_err(SubmitError::transport)?;

        let status = resp.status();
        let body = resp.try_into_string().await.map_err(SubmitError::transport)?;

        let rpc: RpcResponse = match serde_json::from_str(&body) {
            Ok(rpc) => rpc,
            Err(err) if status.is_success() => {
                return Err(SubmitError::transport(format!(
                    "invalid json-rpc response: {err}"
                )));
            }
            Err(_) => {
                return Err(SubmitError::transport(format!(
                    "endpoint replied with status {status}"
                )));
            }
        };

        if let Some(err) = rpc.error {
            return Err(SubmitError::Rejected {
                code: err.code,
                log: err.describe(),
            });
        }
        if !status.is_success() {
            return Err(SubmitError::transport(format!(
                "endpoint replied with status {status}"
            )));
        }

        let result = rpc
            .result
            .ok_or_else(|| SubmitError::transport("json-rpc response without result"))?;

        match method {
            BroadcastMethod::Async => Ok(()),
            BroadcastMethod::Sync => {
                let result: AbciResult =
                    serde_json::from_value(result).map_err(SubmitError::transport)?;
                check_abci(&result)
            }
            BroadcastMethod::Commit => {
                let result: CommitResult =
                    serde_json::from_value(result).map_err(SubmitError::transport)?;
                check_abci(&result.check_tx)?;
                check_abci(&result.tx_result)
            }
        }
    }
}

fn check_abci(result: &AbciResult) -> Result<(), SubmitError> {
    if result.code == 0 {
        Ok(())
    } else {
        Err(SubmitError::Rejected {
            code: result.code as i64,
            log: result.log.clone(),
        })
    }
}
