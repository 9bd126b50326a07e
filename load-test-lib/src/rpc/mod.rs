//! CometBFT RPC access.
//!
//! The [`Dialer`] trait is the seam between the load engine and the network:
//! production code dials real endpoints over HTTP(S) using [`HttpDialer`],
//! tests plug in in-process services.

use std::time::Duration;

use rama::{
    Layer as _,
    error::{BoxError, ErrorContext as _},
    http::{
        HeaderValue, Uri,
        client::EasyHttpWebClient,
        layer::{
            map_request_body::MapRequestBodyLayer,
            required_header::AddRequiredRequestHeadersLayer,
        },
    },
    layer::TimeoutLayer,
    rt::Executor,
    telemetry::tracing,
};

mod client;
mod jsonrpc;

pub use self::client::{RpcClient, SubmitError};

use crate::utils::env::network_service_identifier;

/// Opens connections to RPC endpoints.
pub trait Dialer: Clone + Send + Sync + 'static {
    /// Open a connection to the given endpoint.
    ///
    /// Implementations verify the endpoint is usable before returning.
    fn dial(&self, endpoint: &Uri) -> impl Future<Output = Result<RpcClient, BoxError>> + Send;

    /// Apply the per request timeout of a run to all future dials.
    fn with_request_timeout(self, timeout: Duration) -> Self {
        let _ = timeout;
        self
    }
}

/// [`Dialer`] for real CometBFT nodes over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpDialer {
    exec: Executor,
    request_timeout: Duration,
}

impl HttpDialer {
    pub fn new(exec: Executor, request_timeout: Duration) -> Self {
        Self {
            exec,
            request_timeout,
        }
    }

    fn new_client(&self, endpoint: &Uri) -> Result<RpcClient, BoxError> {
        let web_client = EasyHttpWebClient::connector_builder()
            .with_default_transport_connector()
            .without_tls_proxy_support()
            .without_proxy_support()
            .with_tls_support_using_boringssl(None)
            .with_default_http_connector(self.exec.clone())
            .try_with_default_connection_pool()
            .context("create connection pool for rpc web client")?
            .build_client();

        // no retry layer: failed submissions are classified and
        // recovered from by the connection itself
        let client = (
            TimeoutLayer::new(self.request_timeout),
            AddRequiredRequestHeadersLayer::new()
                .with_user_agent_header_value(HeaderValue::from_static(network_service_identifier())),
            MapRequestBodyLayer::new_boxed_streaming_body(),
        )
            .into_layer(web_client);

        Ok(RpcClient::new(endpoint.clone(), client))
    }
}

impl Dialer for HttpDialer {
    async fn dial(&self, endpoint: &Uri) -> Result<RpcClient, BoxError> {
        let client = self.new_client(endpoint)?;
        client.health().await?;
        tracing::debug!(%endpoint, "connected to rpc endpoint");
        Ok(client)
    }

    fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
