use std::{path::PathBuf, time::Duration};

use rama::{
    error::{BoxError, ErrorContext as _},
    graceful::ShutdownGuard,
    rt::Executor,
    telemetry::tracing,
};

use clap::Args;
use cmt_load_test_lib::{
    config::{normalize_endpoint, parse_duration},
    distributed::worker::{ControlClient, Worker, WorkerConfig, WorkerOutcome},
    rpc::HttpDialer,
    utils::env::default_worker_name,
};

#[derive(Debug, Clone, Args)]
/// join a coordinator and generate load on its command
pub struct WorkerCommand {
    /// address of the coordinator (host:port or http(s)://host:port)
    #[arg(long, value_name = "ADDRESS")]
    coordinator: String,

    /// how long to keep trying to reach the coordinator before the load test started
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, default_value = "60")]
    coordinator_connect_timeout: Duration,

    /// name reported to the coordinator (defaults to the hostname)
    #[arg(long, value_name = "NAME")]
    name: Option<String>,

    /// interval of the stats reports sent to the coordinator
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, default_value = "1")]
    report_interval: Duration,

    /// write a CSV summary of the local run to this file
    #[arg(long, value_name = "FILE")]
    stats_output: Option<PathBuf>,
}

pub async fn exec(_data: PathBuf, guard: ShutdownGuard, args: WorkerCommand) -> Result<(), BoxError> {
    let coordinator = normalize_endpoint(&args.coordinator)
        .context("parse coordinator address")
        .with_context_field("coordinator", || args.coordinator.clone())?;

    let exec = Executor::graceful(guard.clone());
    let control = ControlClient::try_new_http(coordinator, exec.clone())
        .context("create coordinator control client")?;

    // the request timeout is replaced by the one of the start command
    let worker = Worker::new(
        WorkerConfig {
            name: args.name.unwrap_or_else(default_worker_name),
            coordinator_connect_timeout: args.coordinator_connect_timeout,
            report_interval: args.report_interval,
            stats_output: args.stats_output,
        },
        control,
        HttpDialer::new(exec, Duration::from_secs(10)),
    );

    match worker.run(guard.clone_weak().into_cancelled()).await? {
        WorkerOutcome::Completed(run) => {
            if !run.final_report_delivered {
                tracing::warn!(
                    worker_id = %run.worker_id,
                    "load test completed but the coordinator did not receive the final report"
                );
            }
        }
        WorkerOutcome::Interrupted => tracing::info!("worker interrupted before the load test started"),
    }
    Ok(())
}
