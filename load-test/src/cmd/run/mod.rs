use std::{path::PathBuf, time::Duration};

use rama::{
    error::{BoxError, ErrorContext as _},
    graceful::ShutdownGuard,
    rt::Executor,
    telemetry::tracing,
};

use clap::Args;
use cmt_load_test_lib::{engine::Reporter, rpc::HttpDialer, standalone};

use super::LoadTestArgs;

pub mod reporter;

use self::reporter::{HumanReporter, JsonlReporter};

#[derive(Debug, Clone, Args)]
/// run a standalone load test against one or more endpoints
pub struct RunCommand {
    #[clap(flatten)]
    load_test: LoadTestArgs,

    /// report json lines instead of a human-friendly format
    #[arg(long, default_value_t = false)]
    json: bool,

    /// write a CSV summary of the run to this file
    #[arg(long, value_name = "FILE")]
    stats_output: Option<PathBuf>,
}

pub async fn exec(_data: PathBuf, guard: ShutdownGuard, args: RunCommand) -> Result<(), BoxError> {
    let config = args.load_test.into_config();
    config.validate().context("invalid load test configuration")?;

    tracing::info!(
        connections = config.connections,
        rate = config.rate,
        size = config.size,
        duration = ?config.duration,
        method = %config.broadcast_method,
        endpoints = ?config.endpoints,
        tx_seed = config.tx_seed,
        "starting standalone load test"
    );

    let dialer = HttpDialer::new(Executor::graceful(guard.clone()), config.request_timeout);

    let mut reporter: Box<dyn Reporter> = if args.json {
        Box::new(JsonlReporter::new(std::io::stdout()))
    } else {
        Box::new(HumanReporter::new(std::io::stdout()))
    };

    let summary = standalone::run(
        guard.clone_weak().into_cancelled(),
        config,
        dialer,
        reporter.as_mut(),
        args.stats_output.as_deref(),
    )
    .await?;

    tracing::debug!(
        end = ?summary.end,
        elapsed = ?summary.elapsed,
        "standalone load test done"
    );
    Ok(())
}

/// Transactions per second over the given period.
pub(crate) fn per_second(count: u64, period: Duration) -> f64 {
    let secs = period.as_secs_f64();
    if secs > 0. { count as f64 / secs } else { 0. }
}
