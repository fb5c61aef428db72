//! `schedule` command: run table syncs on their intervals until interrupted.

use std::io::Write;

use camino::Utf8PathBuf;
use clap::Parser;
use hubsync_data::schedule::{ScheduleConfig, Scheduler, TableActivity};
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::engine::{
    ConnectionFields, EndpointEnv, EngineConfig, HttpSources, RunFields, SourceFactory,
};
use crate::sync::write_json;
use crate::{
    ARG_API_TOKEN, ARG_BLOB_BASE_URL, ARG_BLOB_CONTAINER, ARG_CORE_BASE_URL, ARG_DATABASE,
    ARG_MAX_ATTEMPTS, ARG_MAX_PAGES, ARG_MAX_RUN_SECS, ARG_PAGE_SIZE, ARG_QUERY_BLOB_PROPERTIES,
    ARG_SCHEDULE_FILE, ARG_TIMEOUT_SECS, CliError, ENV_SCHEDULE_FILE,
};

static SCHEDULE_ENV: EndpointEnv = EndpointEnv {
    core_base_url: "HUBSYNC_CMDS_SCHEDULE_CORE_BASE_URL",
    blob_base_url: "HUBSYNC_CMDS_SCHEDULE_BLOB_BASE_URL",
    blob_container: "HUBSYNC_CMDS_SCHEDULE_BLOB_CONTAINER",
};

/// CLI arguments for the `schedule` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Load a JSON schedule naming each table's interval and \
                 mode, then sync every enabled table on its interval until \
                 Ctrl-C. In-flight runs stop at their next page boundary \
                 and a summary of the session is printed.",
    about = "Sync tables on their schedules"
)]
#[ortho_config(prefix = "HUBSYNC")]
pub(crate) struct ScheduleArgs {
    /// Path to the JSON schedule file.
    #[arg(long = ARG_SCHEDULE_FILE, value_name = "path")]
    #[serde(default)]
    pub(crate) schedule: Option<Utf8PathBuf>,
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
    /// Pages fetched per scheduled run.
    #[arg(long = ARG_MAX_PAGES, value_name = "count")]
    #[serde(default)]
    pub(crate) max_pages: Option<usize>,
    /// Time budget of each scheduled run in seconds.
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

impl ScheduleArgs {
    fn into_config(self) -> Result<ScheduleCommandConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        ScheduleCommandConfig::try_from(merged)
    }
}

/// Resolved `schedule` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScheduleCommandConfig {
    pub(crate) schedule_path: Utf8PathBuf,
    pub(crate) engine: EngineConfig,
}

impl TryFrom<ScheduleArgs> for ScheduleCommandConfig {
    type Error = CliError;

    fn try_from(args: ScheduleArgs) -> Result<Self, Self::Error> {
        let schedule_path = args.schedule.ok_or(CliError::MissingArgument {
            field: ARG_SCHEDULE_FILE,
            env: ENV_SCHEDULE_FILE,
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
            &SCHEDULE_ENV,
        )?;
        Ok(Self {
            schedule_path,
            engine,
        })
    }
}

pub(super) fn run_schedule(args: ScheduleArgs) -> Result<(), CliError> {
    let config = args.into_config()?;
    let shutdown = CancellationToken::new();
    let mut stdout = std::io::stdout().lock();
    execute_schedule(&config, &HttpSources, &shutdown, &mut stdout)
}

/// Build the scheduler from `config` and run it until `shutdown` fires or
/// the process is interrupted, then print the activity report.
pub(crate) fn execute_schedule(
    config: &ScheduleCommandConfig,
    sources: &dyn SourceFactory,
    shutdown: &CancellationToken,
    writer: &mut dyn Write,
) -> Result<(), CliError> {
    let scheduler = build_scheduler(config, sources)?;
    let runtime = crate::build_runtime()?;
    crate::cancel_on_interrupt(&runtime, shutdown);
    let activity: Vec<TableActivity> = runtime.block_on(scheduler.run(shutdown.clone()));
    write_json(writer, &activity)
}

pub(crate) fn build_scheduler(
    config: &ScheduleCommandConfig,
    sources: &dyn SourceFactory,
) -> Result<Scheduler, CliError> {
    let schedule = ScheduleConfig::load(&config.schedule_path)?;
    if schedule.enabled().next().is_none() {
        return Err(CliError::NothingScheduled {
            path: config.schedule_path.clone(),
        });
    }

    let store = config.engine.open_store()?;
    let mut scheduler = Scheduler::new();
    for table in schedule.enabled() {
        let manager = config.engine.table_sync(&table.table, &store, sources)?;
        scheduler.register(table.clone(), manager)?;
    }
    Ok(scheduler)
}
