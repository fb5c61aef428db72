//! Wiring from resolved options to the store, remote clients and managers.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use hubsync_core::{
    BlobStorage, CLOUD_BLOB_TABLE, CloudBlobAdapter, CoreClient, CoreEntity, CoreEntityAdapter,
    RetryPolicy, SqliteStore, SyncManager, SyncOptions, TableSync,
};
use hubsync_data::http::{HttpBlobStorage, HttpClientConfig, HttpCoreClient};

use crate::{
    ARG_BLOB_BASE_URL, ARG_BLOB_CONTAINER, ARG_CORE_BASE_URL, ARG_MAX_ATTEMPTS, ARG_MAX_PAGES,
    ARG_MAX_RUN_SECS, ARG_PAGE_SIZE, ARG_TIMEOUT_SECS, CliError,
};

/// Database used when `--database` is not given.
pub(crate) const DEFAULT_DATABASE: &str = "hubsync.db";

/// Every table the CLI knows how to sync, in report order.
pub(crate) fn known_tables() -> Vec<&'static str> {
    CoreEntity::ALL
        .into_iter()
        .map(CoreEntity::table_name)
        .chain([CLOUD_BLOB_TABLE])
        .collect()
}

/// Connection options shared by every subcommand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ConnectionFields {
    pub(crate) database: Option<Utf8PathBuf>,
    pub(crate) core_base_url: Option<String>,
    pub(crate) blob_base_url: Option<String>,
    pub(crate) blob_container: Option<String>,
    pub(crate) api_token: Option<String>,
    pub(crate) timeout_secs: Option<u64>,
}

/// Run tuning shared by `sync` and `schedule`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RunFields {
    pub(crate) page_size: Option<usize>,
    pub(crate) max_pages: Option<usize>,
    pub(crate) max_run_secs: Option<u64>,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) query_blob_properties: Option<bool>,
}

/// Environment variables reported when an endpoint option is missing.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct EndpointEnv {
    pub(crate) core_base_url: &'static str,
    pub(crate) blob_base_url: &'static str,
    pub(crate) blob_container: &'static str,
}

/// Fully resolved connection and run settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EngineConfig {
    pub(crate) database: Utf8PathBuf,
    pub(crate) core_base_url: Option<String>,
    pub(crate) blob_base_url: Option<String>,
    pub(crate) blob_container: Option<String>,
    pub(crate) api_token: Option<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) options: SyncOptions,
    pub(crate) query_blob_properties: bool,
    pub(crate) env: &'static EndpointEnv,
}

impl EngineConfig {
    pub(crate) fn resolve(
        connection: ConnectionFields,
        run: RunFields,
        env: &'static EndpointEnv,
    ) -> Result<Self, CliError> {
        let mut options = SyncOptions::default();
        if let Some(page_size) = run.page_size {
            options = options.with_page_size(positive(ARG_PAGE_SIZE, page_size)?);
        }
        if let Some(max_pages) = run.max_pages {
            options = options.with_max_pages(positive(ARG_MAX_PAGES, max_pages)?);
        }
        if let Some(secs) = run.max_run_secs {
            options = options.with_timeout(Duration::from_secs(positive(ARG_MAX_RUN_SECS, secs)?));
        }
        if let Some(attempts) = run.max_attempts {
            let attempts = positive(ARG_MAX_ATTEMPTS, attempts)?;
            options = options.with_retry(RetryPolicy::default().with_max_attempts(attempts));
        }
        let timeout = connection
            .timeout_secs
            .map(|secs| positive(ARG_TIMEOUT_SECS, secs).map(Duration::from_secs))
            .transpose()?;

        Ok(Self {
            database: connection
                .database
                .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_DATABASE)),
            core_base_url: connection.core_base_url,
            blob_base_url: connection.blob_base_url,
            blob_container: connection.blob_container,
            api_token: connection.api_token,
            timeout,
            options,
            query_blob_properties: run.query_blob_properties.unwrap_or(false),
            env,
        })
    }

    /// Open the SQLite database, creating it when missing.
    pub(crate) fn open_store(&self) -> Result<SqliteStore, CliError> {
        SqliteStore::open(&self.database).map_err(|source| CliError::OpenDatabase {
            path: self.database.clone(),
            source,
        })
    }

    /// Return `true` when the remote endpoint for `table` is configured.
    pub(crate) fn has_remote(&self, table: &str) -> bool {
        if table == CLOUD_BLOB_TABLE {
            self.blob_base_url.is_some() && self.blob_container.is_some()
        } else {
            self.core_base_url.is_some()
        }
    }

    /// Build the sync manager for `table` over `store`.
    pub(crate) fn table_sync(
        &self,
        table: &str,
        store: &SqliteStore,
        sources: &dyn SourceFactory,
    ) -> Result<Arc<dyn TableSync>, CliError> {
        if table == CLOUD_BLOB_TABLE {
            let (base_url, container) = self.blob_endpoint()?;
            let storage = sources.blob_storage(self.http_config(base_url), container)?;
            let adapter =
                CloudBlobAdapter::new(storage).with_blob_properties(self.query_blob_properties);
            return Ok(Arc::new(
                SyncManager::new(adapter, store.clone(), store.clone())
                    .with_options(self.options.clone()),
            ));
        }

        let entity = CoreEntity::from_str(table).map_err(|_| CliError::UnknownTable {
            table: table.to_owned(),
            expected: known_tables().join(", "),
        })?;
        let base_url = self
            .core_base_url
            .as_deref()
            .ok_or(CliError::MissingArgument {
                field: ARG_CORE_BASE_URL,
                env: self.env.core_base_url,
            })?;
        let client = sources.core_client(self.http_config(base_url))?;
        Ok(Arc::new(
            SyncManager::new(
                CoreEntityAdapter::new(client, entity),
                store.clone(),
                store.clone(),
            )
            .with_options(self.options.clone()),
        ))
    }

    fn blob_endpoint(&self) -> Result<(&str, &str), CliError> {
        let base_url = self
            .blob_base_url
            .as_deref()
            .ok_or(CliError::MissingArgument {
                field: ARG_BLOB_BASE_URL,
                env: self.env.blob_base_url,
            })?;
        let container = self
            .blob_container
            .as_deref()
            .ok_or(CliError::MissingArgument {
                field: ARG_BLOB_CONTAINER,
                env: self.env.blob_container,
            })?;
        Ok((base_url, container))
    }

    fn http_config(&self, base_url: &str) -> HttpClientConfig {
        let mut config = HttpClientConfig::new(base_url);
        if let Some(timeout) = self.timeout {
            config = config.with_timeout(timeout);
        }
        if let Some(token) = &self.api_token {
            config = config.with_bearer_token(token.clone());
        }
        config
    }
}

fn positive<T: Default + PartialEq>(field: &'static str, value: T) -> Result<T, CliError> {
    if value == T::default() {
        Err(CliError::InvalidArgument {
            field,
            reason: "must be greater than zero".to_owned(),
        })
    } else {
        Ok(value)
    }
}

/// Builds the remote clients behind each sync manager.
pub(crate) trait SourceFactory {
    fn core_client(&self, config: HttpClientConfig) -> Result<Arc<dyn CoreClient>, CliError>;

    fn blob_storage(
        &self,
        config: HttpClientConfig,
        container: &str,
    ) -> Result<Arc<dyn BlobStorage>, CliError>;
}

/// [`SourceFactory`] producing the HTTP clients.
pub(crate) struct HttpSources;

impl SourceFactory for HttpSources {
    fn core_client(&self, config: HttpClientConfig) -> Result<Arc<dyn CoreClient>, CliError> {
        let base_url = config.base_url.clone();
        let client = HttpCoreClient::with_config(config)
            .map_err(|source| CliError::BuildClient { base_url, source })?;
        Ok(Arc::new(client))
    }

    fn blob_storage(
        &self,
        config: HttpClientConfig,
        container: &str,
    ) -> Result<Arc<dyn BlobStorage>, CliError> {
        let base_url = config.base_url.clone();
        let storage = HttpBlobStorage::with_config(config, container)
            .map_err(|source| CliError::BuildClient { base_url, source })?;
        Ok(Arc::new(storage))
    }
}
