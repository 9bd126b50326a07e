use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Parser;
use rama::{
    Layer as _, Service,
    error::BoxError,
    http::{
        BodyExtractExt as _, Request, Response, client::EasyHttpWebClient,
        layer::map_request_body::MapRequestBodyLayer, service::client::HttpClientExt as _,
    },
    layer::TimeoutLayer,
    net::address::SocketAddress,
    rt::Executor,
};

use crate::Args;

/// An app instance running on its own thread and runtime.
pub(super) struct App {
    pub data_dir: PathBuf,
    handle: std::thread::JoinHandle<Result<(), BoxError>>,
}

impl App {
    /// Wait for the app to exit by itself.
    pub async fn join(self) -> Result<(), BoxError> {
        tokio::task::spawn_blocking(move || self.handle.join().expect("app thread not to panic"))
            .await
            .unwrap()
    }

    pub async fn server_addr(&self, name: &str) -> SocketAddress {
        tokio::time::timeout(
            Duration::from_secs(30),
            read_file_or_wait(self.data_dir.join(format!("{name}.addr.txt"))),
        )
        .await
        .unwrap()
    }
}

/// Spawn the app with the given arguments (program name excluded),
/// using a fresh data directory.
pub(super) fn spawn_app(name: &str, args: &[&str]) -> App {
    let data_dir = crate::test::tmp_dir::try_new(name).unwrap();
    eprintln!("{name} data stored under: {data_dir:?}");
    spawn_app_in(data_dir, args)
}

pub(super) fn spawn_app_in(data_dir: PathBuf, args: &[&str]) -> App {
    let data_dir_str = data_dir.display().to_string();

    let mut argv: Vec<&str> = vec![
        cmt_load_test_lib::utils::env::project_name(),
        "--data",
        &data_dir_str,
        "--graceful",
        "0.42",
    ];
    argv.extend(args);

    let args = Args::try_parse_from(argv).unwrap();

    let handle = std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(crate::run_with_args(std::future::pending::<()>(), args))
    });

    App { data_dir, handle }
}

/// A mock node with default behaviour, returning its http base uri.
pub(super) async fn spawn_mock_node(extra_args: &[&str]) -> (App, String) {
    let mut args = vec!["mock-node", "--bind", "127.0.0.1:0"];
    args.extend(extra_args);
    let app = spawn_app("mock_node_e2e", &args);
    let addr = app.server_addr("mock-node").await;
    assert!(addr.ip_addr.is_loopback());
    (app, format!("http://{addr}"))
}

pub(super) fn client() -> impl Service<Request, Output = Response, Error = BoxError> {
    let inner = EasyHttpWebClient::connector_builder()
        .with_default_transport_connector()
        .without_tls_proxy_support()
        .without_proxy_support()
        .with_tls_support_using_boringssl(None)
        .with_default_http_connector(Executor::default())
        .try_with_default_connection_pool()
        .expect("create connection pool for e2e web client")
        .build_client();

    (
        TimeoutLayer::new(Duration::from_secs(30)),
        MapRequestBodyLayer::new_boxed_streaming_body(),
    )
        .into_layer(inner)
}

/// Number of transactions the mock node accepted so far.
pub(super) async fn accepted_txs(node: &str) -> u64 {
    client()
        .get(format!("{node}/counter/txs"))
        .send()
        .await
        .unwrap()
        .try_into_string()
        .await
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

pub(super) fn csv_value(csv: &str, parameter: &str) -> f64 {
    csv.lines()
        .find_map(|line| {
            let mut columns = line.split(',');
            (columns.next() == Some(parameter)).then(|| columns.next())?
        })
        .unwrap_or_else(|| panic!("parameter {parameter} missing in: {csv}"))
        .parse()
        .unwrap()
}

pub(super) fn read_csv(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

async fn read_file_or_wait(path: PathBuf) -> SocketAddress {
    loop {
        match tokio::fs::read_to_string(&path).await {
            Ok(s) => {
                let s = s.trim();
                if s.is_empty() {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
                match s.parse() {
                    Ok(addr) => return addr,
                    Err(err) => {
                        eprintln!("unexpected error parsing socket addr (content={s:?}): {err}");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        continue;
                    }
                }
            }
            Err(err) => {
                if err.kind() == ErrorKind::NotFound {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                } else {
                    panic!("unexpected error: {err}");
                }
            }
        }
    }
}
