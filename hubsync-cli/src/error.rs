//! Error types emitted by the hubsync CLI.
//!
//! Keep this error type reasonably small, as many CLI helpers return
//! `Result<_, CliError>` and the workspace enables `clippy::result_large_err`.

use std::sync::Arc;

use camino::Utf8PathBuf;
use hubsync_core::{CheckpointStoreError, LocalStoreError, RunStatus, SqliteStoreError};
use hubsync_data::http::ClientBuildError;
use hubsync_data::schedule::ScheduleError;
use thiserror::Error;

/// Errors emitted by the hubsync CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Provided arguments failed Clap validation.
    #[error(transparent)]
    ArgumentParsing(#[from] clap::Error),
    /// Configuration layering failed (files, env, CLI).
    #[error("failed to load configuration: {0}")]
    Configuration(#[from] Arc<ortho_config::OrthoError>),
    /// A required option is missing after configuration merging.
    #[error("missing {field} (set --{field} or {env})")]
    MissingArgument {
        field: &'static str,
        env: &'static str,
    },
    /// An option was given a value it cannot take.
    #[error("invalid {field}: {reason}")]
    InvalidArgument { field: &'static str, reason: String },
    /// The table name matches neither a Core entity nor the blob table.
    #[error("unknown table `{table}`; expected one of {expected}")]
    UnknownTable { table: String, expected: String },
    /// Opening the local database failed.
    #[error("failed to open database at {path:?}: {source}")]
    OpenDatabase {
        path: Utf8PathBuf,
        #[source]
        source: SqliteStoreError,
    },
    /// Reading local table state failed.
    #[error("failed to read local tables: {0}")]
    ReadTables(#[from] LocalStoreError),
    /// Reading a checkpoint failed.
    #[error("failed to read checkpoint: {0}")]
    ReadCheckpoint(#[from] CheckpointStoreError),
    /// Building an HTTP client failed.
    #[error("failed to build HTTP client for {base_url:?}: {source}")]
    BuildClient {
        base_url: String,
        #[source]
        source: ClientBuildError,
    },
    /// Loading or applying the schedule failed.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    /// The schedule enables no tables.
    #[error("schedule {path:?} enables no tables")]
    NothingScheduled { path: Utf8PathBuf },
    /// Building the Tokio runtime failed.
    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),
    /// A sync run ended in a state that needs attention.
    #[error("sync of {table} ended {status}")]
    SyncFailed { table: String, status: RunStatus },
    /// Serializing a report failed.
    #[error("failed to serialize report: {0}")]
    SerializeReport(#[source] serde_json::Error),
    /// Writing a report failed.
    #[error("failed to write report: {0}")]
    WriteReport(#[source] std::io::Error),
}
