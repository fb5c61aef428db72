//! `status` command: checkpoints, local counts and remote drift per table.

use std::io::Write;

use camino::Utf8PathBuf;
use clap::Parser;
use hubsync_core::{CheckpointStore, LocalStore, Reconciliation, SqliteStore, SyncCheckpoint};
use log::warn;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};

use crate::engine::{
    ConnectionFields, EndpointEnv, EngineConfig, HttpSources, RunFields, SourceFactory,
    known_tables,
};
use crate::sync::{error_chain, write_json};
use crate::{
    ARG_API_TOKEN, ARG_BLOB_BASE_URL, ARG_BLOB_CONTAINER, ARG_CORE_BASE_URL, ARG_DATABASE,
    ARG_TIMEOUT_SECS, CliError,
};

static STATUS_ENV: EndpointEnv = EndpointEnv {
    core_base_url: "HUBSYNC_CMDS_STATUS_CORE_BASE_URL",
    blob_base_url: "HUBSYNC_CMDS_STATUS_BLOB_BASE_URL",
    blob_container: "HUBSYNC_CMDS_STATUS_BLOB_CONTAINER",
};

/// CLI arguments for the `status` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Report every known table's checkpoint and local row \
                 count. When a table's remote endpoint is configured, its \
                 authoritative count is fetched as well and the drift \
                 between the two is reported. Nothing is written.",
    about = "Print checkpoints and row counts"
)]
#[ortho_config(prefix = "HUBSYNC")]
pub(crate) struct StatusArgs {
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
    /// Blob container to count.
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
}

impl StatusArgs {
    fn into_config(self) -> Result<EngineConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        engine_config(merged)
    }
}

pub(crate) fn engine_config(args: StatusArgs) -> Result<EngineConfig, CliError> {
    EngineConfig::resolve(
        ConnectionFields {
            database: args.database,
            core_base_url: args.core_base_url,
            blob_base_url: args.blob_base_url,
            blob_container: args.blob_container,
            api_token: args.api_token,
            timeout_secs: args.timeout_secs,
        },
        RunFields::default(),
        &STATUS_ENV,
    )
}

/// Status of one table.
#[derive(Debug, Serialize)]
pub(crate) struct TableStatus {
    pub(crate) table: String,
    pub(crate) present: bool,
    pub(crate) local_rows: u64,
    pub(crate) checkpoint: SyncCheckpoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) remote_rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) drift: Option<i128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) remote_error: Option<String>,
}

pub(super) fn run_status(args: StatusArgs) -> Result<(), CliError> {
    let mut stdout = std::io::stdout().lock();
    run_status_with(args, &HttpSources, &mut stdout)
}

pub(super) fn run_status_with(
    args: StatusArgs,
    sources: &dyn SourceFactory,
    writer: &mut dyn Write,
) -> Result<(), CliError> {
    let config = args.into_config()?;
    let statuses = collect_status(&config, sources)?;
    write_json(writer, &statuses)
}

pub(crate) fn collect_status(
    config: &EngineConfig,
    sources: &dyn SourceFactory,
) -> Result<Vec<TableStatus>, CliError> {
    let store = config.open_store()?;
    known_tables()
        .into_iter()
        .map(|table| table_status(config, &store, sources, table))
        .collect()
}

fn table_status(
    config: &EngineConfig,
    store: &SqliteStore,
    sources: &dyn SourceFactory,
    table: &str,
) -> Result<TableStatus, CliError> {
    let checkpoint = store
        .get(table)?
        .unwrap_or_else(|| SyncCheckpoint::never_run(table));
    let mut status = TableStatus {
        table: table.to_owned(),
        present: store.table_exists(table)?,
        local_rows: store.count(table)?,
        checkpoint,
        remote_rows: None,
        drift: None,
        remote_error: None,
    };
    if !config.has_remote(table) {
        return Ok(status);
    }

    match config.table_sync(table, store, sources)?.probe() {
        Ok(probe) => apply_probe(&mut status, &probe),
        Err(err) => {
            warn!("could not reconcile {table}: {err}");
            status.remote_error = Some(error_chain(&err));
        }
    }
    Ok(status)
}

fn apply_probe(status: &mut TableStatus, probe: &Reconciliation) {
    let (local, remote) = probe.counts();
    status.local_rows = local;
    status.remote_rows = Some(remote);
    status.drift = Some(probe.drift());
}
