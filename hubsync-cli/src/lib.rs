//! Command-line interface for the hubsync ingestion engine.
//!
//! Every subcommand layers its options from CLI flags, `HUBSYNC_CMDS_*`
//! environment variables and configuration files through `ortho_config`,
//! then prints a JSON report on standard output.
#![forbid(unsafe_code)]

use clap::{Parser, Subcommand};
use log::info;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

mod engine;
mod error;
mod schedule;
mod status;
mod sync;

pub use error::CliError;

use schedule::ScheduleArgs;
use status::StatusArgs;
use sync::SyncArgs;

pub(crate) const ARG_DATABASE: &str = "database";
pub(crate) const ARG_CORE_BASE_URL: &str = "core-base-url";
pub(crate) const ARG_BLOB_BASE_URL: &str = "blob-base-url";
pub(crate) const ARG_BLOB_CONTAINER: &str = "blob-container";
pub(crate) const ARG_API_TOKEN: &str = "api-token";
pub(crate) const ARG_TIMEOUT_SECS: &str = "timeout-secs";
pub(crate) const ARG_PAGE_SIZE: &str = "page-size";
pub(crate) const ARG_MAX_PAGES: &str = "max-pages";
pub(crate) const ARG_MAX_RUN_SECS: &str = "max-run-secs";
pub(crate) const ARG_MAX_ATTEMPTS: &str = "max-attempts";
pub(crate) const ARG_QUERY_BLOB_PROPERTIES: &str = "query-blob-properties";
pub(crate) const ARG_SYNC_TABLE: &str = "table";
pub(crate) const ARG_SYNC_MODE: &str = "mode";
pub(crate) const ARG_SCHEDULE_FILE: &str = "schedule";

pub(crate) const ENV_SYNC_TABLE: &str = "HUBSYNC_CMDS_SYNC_TABLE";
pub(crate) const ENV_SCHEDULE_FILE: &str = "HUBSYNC_CMDS_SCHEDULE_SCHEDULE";

/// Run the hubsync CLI with the current process arguments and environment.
///
/// # Errors
/// Returns [`CliError`] when arguments or configuration are invalid, when a
/// store or remote client cannot be set up, or when a sync run fails.
pub fn run() -> Result<(), CliError> {
    let cli = Cli::try_parse().map_err(CliError::ArgumentParsing)?;
    match cli.command {
        Command::Sync(args) => sync::run_sync(args),
        Command::Status(args) => status::run_status(args),
        Command::Schedule(args) => schedule::run_schedule(args),
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "hubsync",
    about = "Mirror Core entities and cloud blob listings into SQLite",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one sync of a table and print the run report.
    Sync(SyncArgs),
    /// Print checkpoints and row counts for every known table.
    Status(StatusArgs),
    /// Sync tables on their schedules until interrupted.
    Schedule(ScheduleArgs),
}

/// Build a small multi-threaded runtime for signal handling and scheduling.
pub(crate) fn build_runtime() -> Result<Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("hubsync")
        .enable_all()
        .build()
        .map_err(CliError::Runtime)
}

/// Cancel `token` on the first Ctrl-C delivered to the process.
pub(crate) fn cancel_on_interrupt(runtime: &Runtime, token: &CancellationToken) {
    let token = token.clone();
    runtime.spawn(async move {
        tokio::select! {
            () = token.cancelled() => {}
            signal = tokio::signal::ctrl_c() => {
                if signal.is_ok() {
                    info!("interrupt received; stopping at the next page boundary");
                    token.cancel();
                }
            }
        }
    });
}

#[cfg(test)]
mod tests;
