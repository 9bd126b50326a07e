use std::{path::PathBuf, time::Duration};

use rama::{
    error::{BoxError, ErrorContext as _},
    graceful::ShutdownGuard,
    net::socket::Interface,
    telemetry::tracing,
};

use clap::Args;
use cmt_load_test_lib::{
    config::parse_duration,
    distributed::coordinator::{Coordinator, CoordinatorConfig, WorkerState},
};

use super::LoadTestArgs;
use crate::server::write_server_socket_address_as_file;

#[derive(Debug, Clone, Args)]
/// coordinate a load test over one or more workers,
/// serving the aggregate as prometheus metrics
pub struct CoordinatorCommand {
    #[clap(flatten)]
    load_test: LoadTestArgs,

    /// network interface to bind the control and metrics http server to
    #[arg(
        long,
        short = 'b',
        value_name = "INTERFACE",
        default_value = "0.0.0.0:26670"
    )]
    bind: Interface,

    /// number of workers required before the load test starts
    #[arg(long, short = 'w', value_name = "N", default_value_t = 1)]
    expect_workers: usize,

    /// how long to wait for all expected workers to register
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, default_value = "60")]
    worker_connect_timeout: Duration,

    /// silence after which a worker is considered lost
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, default_value = "10")]
    liveness_timeout: Duration,

    /// how long to keep serving the final metrics once the load test finished
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, default_value = "0")]
    shutdown_wait: Duration,

    /// identifier attached to every metric of this load test
    #[arg(long, value_name = "ID", default_value = "0")]
    load_test_id: String,
}

pub async fn exec(
    data: PathBuf,
    guard: ShutdownGuard,
    args: CoordinatorCommand,
) -> Result<(), BoxError> {
    let coordinator = Coordinator::bind(CoordinatorConfig {
        bind: args.bind,
        expect_workers: args.expect_workers,
        worker_connect_timeout: args.worker_connect_timeout,
        liveness_timeout: args.liveness_timeout,
        shutdown_wait: args.shutdown_wait,
        load_test_id: args.load_test_id,
        load_test: args.load_test.into_config(),
    })
    .await
    .context("start coordinator")?;

    write_server_socket_address_as_file(&data, "coordinator", coordinator.local_addr()).await?;

    let outcome = coordinator.run(guard.clone_weak().into_cancelled()).await?;
    let metrics = &outcome.metrics;

    tracing::info!(
        load_test_id = %metrics.load_test_id,
        interrupted = outcome.interrupted,
        completed_workers = metrics.count_in_state(WorkerState::Completed),
        lost_workers = metrics.count_in_state(WorkerState::Lost),
        attempted = metrics.total.attempted,
        succeeded = metrics.total.succeeded,
        failed = metrics.total.failed,
        rate = metrics.rate,
        "coordinator done"
    );
    Ok(())
}
