#![cfg_attr(
    not(test),
    warn(clippy::print_stdout, clippy::dbg_macro),
    deny(clippy::unwrap_used, clippy::expect_used)
)]

use std::{path::PathBuf, time::Duration};

use rama::{
    error::{BoxError, ErrorContext as _},
    graceful,
    telemetry::tracing::{self, Instrument as _},
};

use clap::{Parser, Subcommand};
use cmt_load_test_lib::utils;
use tokio::sync::oneshot;

pub mod cmd;
pub mod server;

#[cfg(target_family = "unix")]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[cfg(target_os = "windows")]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[cfg(test)]
pub mod test;

/// CLI arguments of the load tester.
///
/// Without a subcommand the load test runs standalone,
/// taking the same arguments as the `run` subcommand.
#[derive(Debug, Clone, Parser)]
#[command(name = "cmt-load-test")]
#[command(bin_name = "cmt-load-test")]
#[command(version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Args {
    #[command(subcommand)]
    cmds: Option<CliCommands>,

    #[clap(flatten)]
    run: Option<cmd::run::RunCommand>,

    /// debug logging as default instead of Info; use RUST_LOG env for more options
    #[arg(long, short = 'v', default_value_t = false, global = true)]
    pub verbose: bool,

    /// enable pretty logging (format for humans)
    #[arg(long, default_value_t = false, global = true)]
    pub pretty: bool,

    /// write the tracing output to the provided (log) file instead of stderr
    #[arg(long, short = 'o', global = true)]
    pub output: Option<PathBuf>,

    /// directory in which runtime files (e.g. bound addresses) are written
    #[arg(long, short = 'D', default_value = ".cmt-load-test", global = true)]
    pub data: PathBuf,

    #[arg(long, value_name = "SECONDS", default_value_t = 5., global = true)]
    /// the graceful shutdown timeout (<= 0.0 = no timeout)
    pub graceful: f64,

    #[cfg(target_family = "unix")]
    /// Set the limit of max open file descriptors for this process and its children.
    #[arg(long, value_name = "N", default_value_t = 262_144, global = true)]
    pub ulimit: rama::unix::utils::rlim_t,
}

#[derive(Debug, Clone, Subcommand)]
#[allow(clippy::large_enum_variant)]
enum CliCommands {
    Run(self::cmd::run::RunCommand),
    Coordinator(self::cmd::coordinator::CoordinatorCommand),
    Worker(self::cmd::worker::WorkerCommand),
    MockNode(self::cmd::mock_node::MockNodeCommand),
}

impl CliCommands {
    fn name(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Coordinator(_) => "coordinator",
            Self::Worker(_) => "worker",
            Self::MockNode(_) => "mock-node",
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    utils::telemetry::init_tracing(utils::telemetry::TelemetryConfig {
        verbose: args.verbose,
        pretty: args.pretty,
        output: args.output.as_deref(),
    })?;

    #[cfg(target_family = "unix")]
    rama::unix::utils::raise_nofile(args.ulimit).context("set file descriptor limit")?;

    let base_shutdown_signal = graceful::default_signal();
    if let Err(err) = run_with_args(base_shutdown_signal, args).await {
        eprintln!("🚩 exit with error: {err}");
        std::process::exit(1);
    }

    Ok(())
}

/// Runs the selected command until it is finished, failed,
/// or the (graceful) shutdown has been initiated.
///
/// This entry point is used by both the (binary) `main` function as well as
/// for the e2e test suite found in the test module.
async fn run_with_args<F>(base_shutdown_signal: F, args: Args) -> Result<(), BoxError>
where
    F: Future<Output: Send + 'static> + Send + 'static,
{
    let cmd = match (args.cmds, args.run) {
        (Some(cmd), _) => cmd,
        (None, Some(run)) => CliCommands::Run(run),
        (None, None) => {
            return Err(BoxError::from(
                "no load test defined: pass at least --endpoints (see --help)",
            ));
        }
    };

    tokio::fs::create_dir_all(&args.data)
        .await
        .context("create data directory")
        .with_context_debug_field("path", || args.data.clone())?;

    let graceful_timeout = (args.graceful > 0.).then(|| Duration::from_secs_f64(args.graceful));

    // dropped once the command is finished, successfully or not
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let (result_tx, result_rx) = oneshot::channel::<Result<(), BoxError>>();
    let graceful = graceful::Shutdown::new(new_shutdown_signal(done_rx, base_shutdown_signal));

    let data = args.data;
    let cmd_name = cmd.name();
    graceful.spawn_task_fn(async move |guard| {
        let result = match cmd {
            CliCommands::Run(run_args) => self::cmd::run::exec(data, guard, run_args).await,
            CliCommands::Coordinator(coordinator_args) => {
                self::cmd::coordinator::exec(data, guard, coordinator_args)
                    .instrument(tracing::debug_span!(
                        "coordinator server lifetime",
                        server.service.name = format!("{}-coordinator", utils::env::project_name()),
                        otel.kind = "server",
                        network.protocol.name = "http",
                    ))
                    .await
            }
            CliCommands::Worker(worker_args) => {
                self::cmd::worker::exec(data, guard, worker_args).await
            }
            CliCommands::MockNode(mock_args) => {
                self::cmd::mock_node::exec(data, guard, mock_args)
                    .instrument(tracing::debug_span!(
                        "mock node server lifetime",
                        server.service.name = format!("{}-mock-node", utils::env::project_name()),
                        otel.kind = "server",
                        network.protocol.name = "http",
                    ))
                    .await
            }
        };
        if let Err(err) = &result {
            tracing::error!(cmd = cmd_name, "command exited with an error: {err}");
        }
        let _ = result_tx.send(result);
        drop(done_tx);
    });

    let delay = match graceful_timeout {
        Some(duration) => graceful.shutdown_with_limit(duration).await?,
        None => graceful.shutdown().await,
    };
    tracing::debug!("gracefully shutdown with a delay of: {delay:?}");

    match result_rx.await {
        Ok(result) => result,
        Err(_) => Ok(()),
    }
}

fn new_shutdown_signal(
    done_rx: oneshot::Receiver<()>,
    base_shutdown_signal: impl Future<Output: Send + 'static> + Send + 'static,
) -> impl Future + Send + 'static {
    async move {
        tokio::select! {
            _ = base_shutdown_signal => {
                tracing::debug!("default signal triggered: init graceful shutdown");
            }
            _ = done_rx => {
                tracing::debug!("command is finished, return control");
            }
        }
    }
}
