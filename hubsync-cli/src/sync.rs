//! `sync` command: run one table sync and report the outcome.

use std::io::Write;

use camino::Utf8PathBuf;
use clap::Parser;
use hubsync_core::{Cursor, RunStatus, SyncMode, SyncRunResult};
use log::warn;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::engine::{
    ConnectionFields, EndpointEnv, EngineConfig, HttpSources, RunFields, SourceFactory,
};
use crate::{
    ARG_API_TOKEN, ARG_BLOB_BASE_URL, ARG_BLOB_CONTAINER, ARG_CORE_BASE_URL, ARG_DATABASE,
    ARG_MAX_ATTEMPTS, ARG_MAX_PAGES, ARG_MAX_RUN_SECS, ARG_PAGE_SIZE, ARG_QUERY_BLOB_PROPERTIES,
    ARG_SYNC_MODE, ARG_SYNC_TABLE, ARG_TIMEOUT_SECS, CliError, ENV_SYNC_TABLE,
};

pub(crate) static SYNC_ENV: EndpointEnv = EndpointEnv {
    core_base_url: "HUBSYNC_CMDS_SYNC_CORE_BASE_URL",
    blob_base_url: "HUBSYNC_CMDS_SYNC_BLOB_BASE_URL",
    blob_container: "HUBSYNC_CMDS_SYNC_BLOB_CONTAINER",
};

/// CLI arguments for the `sync` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Sync one table from its remote source into the local \
                 SQLite database. Incremental runs continue from the stored \
                 checkpoint; from_scratch runs clear the table first.",
    about = "Run one sync of a table"
)]
#[ortho_config(prefix = "HUBSYNC")]
pub(crate) struct SyncArgs {
    /// Table to sync (`hubtransaction`, `hubcheckout`, `hubcheckouttracker`
    /// or `cloudblob`).
    #[arg(long = ARG_SYNC_TABLE, value_name = "name")]
    #[serde(default)]
    pub(crate) table: Option<String>,
    /// `incremental` (default) or `from_scratch`.
    #[arg(long = ARG_SYNC_MODE, value_name = "mode")]
    #[serde(default)]
    pub(crate) mode: Option<SyncMode>,
    /// Path to the SQLite database.
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
    /// Base URL of the Core API.
    #[arg(long = ARG_CORE_BASE_URL, value_name = "url")]
    #[serde(default)]
    pub(crate) core_base_url: Option<String>,
    /// Base URL of the blob gateway.
    #[arg(long = ARG_BLOB_BASE_URL, value_name = "url")]
    #[serde(default)]
    pub(crate) blob_base_url: Option<String>,
    /// Blob container to list.
    #[arg(long = ARG_BLOB_CONTAINER, value_name = "name")]
    #[serde(default)]
    pub(crate) blob_container: Option<String>,
    /// Bearer token sent to the remote services.
    #[arg(long = ARG_API_TOKEN, value_name = "token")]
    #[serde(default)]
    pub(crate) api_token: Option<String>,
    /// Per-request HTTP timeout in seconds.
    #[arg(long = ARG_TIMEOUT_SECS, value_name = "secs")]
    #[serde(default)]
    pub(crate) timeout_secs: Option<u64>,
    /// Records requested per page.
    #[arg(long = ARG_PAGE_SIZE, value_name = "count")]
    #[serde(default)]
    pub(crate) page_size: Option<usize>,
    /// Stop after this many pages; the next run continues.
    #[arg(long = ARG_MAX_PAGES, value_name = "count")]
    #[serde(default)]
    pub(crate) max_pages: Option<usize>,
    /// Stop fetching once the run has taken this many seconds.
    #[arg(long = ARG_MAX_RUN_SECS, value_name = "secs")]
    #[serde(default)]
    pub(crate) max_run_secs: Option<u64>,
    /// Attempts per page before a transient failure ends the run.
    #[arg(long = ARG_MAX_ATTEMPTS, value_name = "count")]
    #[serde(default)]
    pub(crate) max_attempts: Option<u32>,
    /// Fetch properties for every listed blob.
    #[arg(long = ARG_QUERY_BLOB_PROPERTIES, value_name = "bool")]
    #[serde(default)]
    pub(crate) query_blob_properties: Option<bool>,
}

impl SyncArgs {
    pub(crate) fn into_config(self) -> Result<SyncConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        SyncConfig::try_from(merged)
    }
}

/// Resolved `sync` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SyncConfig {
    pub(crate) table: String,
    pub(crate) mode: SyncMode,
    pub(crate) engine: EngineConfig,
}

impl TryFrom<SyncArgs> for SyncConfig {
    type Error = CliError;

    fn try_from(args: SyncArgs) -> Result<Self, Self::Error> {
        let table = args.table.ok_or(CliError::MissingArgument {
            field: ARG_SYNC_TABLE,
            env: ENV_SYNC_TABLE,
        })?;
        let engine = EngineConfig::resolve(
            ConnectionFields {
                database: args.database,
                core_base_url: args.core_base_url,
                blob_base_url: args.blob_base_url,
                blob_container: args.blob_container,
                api_token: args.api_token,
                timeout_secs: args.timeout_secs,
            },
            RunFields {
                page_size: args.page_size,
                max_pages: args.max_pages,
                max_run_secs: args.max_run_secs,
                max_attempts: args.max_attempts,
                query_blob_properties: args.query_blob_properties,
            },
            &SYNC_ENV,
        )?;
        Ok(Self {
            table,
            mode: args.mode.unwrap_or_default(),
            engine,
        })
    }
}

/// JSON report of one run.
#[derive(Debug, Serialize)]
pub(crate) struct SyncReport {
    pub(crate) table: String,
    pub(crate) mode: SyncMode,
    pub(crate) status: RunStatus,
    pub(crate) pages_fetched: u64,
    pub(crate) rows_written: u64,
    pub(crate) skipped_records: u64,
    pub(crate) cursor: Cursor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
}

impl From<SyncRunResult> for SyncReport {
    fn from(result: SyncRunResult) -> Self {
        Self {
            error: result.error.as_ref().map(|err| error_chain(err)),
            table: result.table_name,
            mode: result.mode,
            status: result.final_status,
            pages_fetched: result.pages_fetched,
            rows_written: result.rows_written,
            skipped_records: result.skipped_records,
            cursor: result.cursor,
        }
    }
}

/// Render an error and its sources on one line.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

pub(super) fn run_sync(args: SyncArgs) -> Result<(), CliError> {
    let runtime = crate::build_runtime()?;
    let cancel = CancellationToken::new();
    crate::cancel_on_interrupt(&runtime, &cancel);
    let mut stdout = std::io::stdout().lock();
    run_sync_with(args, &HttpSources, &cancel, &mut stdout)
}

pub(super) fn run_sync_with(
    args: SyncArgs,
    sources: &dyn SourceFactory,
    cancel: &CancellationToken,
    writer: &mut dyn Write,
) -> Result<(), CliError> {
    let config = args.into_config()?;
    execute_sync(&config, sources, cancel, writer)
}

pub(crate) fn execute_sync(
    config: &SyncConfig,
    sources: &dyn SourceFactory,
    cancel: &CancellationToken,
    writer: &mut dyn Write,
) -> Result<(), CliError> {
    let store = config.engine.open_store()?;
    let manager = config.engine.table_sync(&config.table, &store, sources)?;
    let report = SyncReport::from(manager.run_sync(config.mode, cancel));
    write_json(writer, &report)?;
    match report.status {
        RunStatus::Failed => Err(CliError::SyncFailed {
            table: report.table,
            status: report.status,
        }),
        RunStatus::Partial => {
            warn!(
                "{} is only partially synced; the next incremental run resumes it",
                report.table
            );
            Ok(())
        }
        RunStatus::Success | RunStatus::NeverRun => Ok(()),
    }
}

/// Write `value` as pretty JSON followed by a newline.
pub(crate) fn write_json<T: Serialize>(writer: &mut dyn Write, value: &T) -> Result<(), CliError> {
    let payload = serde_json::to_string_pretty(value).map_err(CliError::SerializeReport)?;
    writer
        .write_all(payload.as_bytes())
        .map_err(CliError::WriteReport)?;
    writer.write_all(b"\n").map_err(CliError::WriteReport)?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn config_from_layers_for_test(
    layers: Vec<ortho_config::MergeLayer<'static>>,
) -> Result<SyncConfig, CliError> {
    let merged = SyncArgs::merge_from_layers(layers).map_err(CliError::from)?;
    SyncConfig::try_from(merged)
}
