//! Test doubles for remote sources and temporary databases.

use std::sync::{Arc, Mutex, PoisonError};

use camino::Utf8PathBuf;
use hubsync_core::test_support::{StubBlobStorage, StubCoreClient};
use hubsync_core::{BlobStorage, CoreClient};
use hubsync_data::http::HttpClientConfig;
use tempfile::TempDir;

use crate::CliError;
use crate::engine::SourceFactory;

/// [`SourceFactory`] handing out in-memory stubs and remembering the
/// configurations it was asked to build clients for.
#[derive(Default)]
pub(super) struct StubSources {
    pub(super) core: Arc<StubCoreClient>,
    pub(super) blobs: Arc<StubBlobStorage>,
    pub(super) configs: Mutex<Vec<HttpClientConfig>>,
}

impl StubSources {
    pub(super) fn with_blobs(names: &[&str]) -> Self {
        Self {
            blobs: Arc::new(StubBlobStorage::with_blob_names(
                "exports",
                names.iter().copied(),
            )),
            ..Self::default()
        }
    }

    pub(super) fn configs(&self) -> Vec<HttpClientConfig> {
        self.configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn remember(&self, config: HttpClientConfig) {
        self.configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(config);
    }
}

impl SourceFactory for StubSources {
    fn core_client(&self, config: HttpClientConfig) -> Result<Arc<dyn CoreClient>, CliError> {
        self.remember(config);
        Ok(Arc::clone(&self.core) as Arc<dyn CoreClient>)
    }

    fn blob_storage(
        &self,
        config: HttpClientConfig,
        _container: &str,
    ) -> Result<Arc<dyn BlobStorage>, CliError> {
        self.remember(config);
        Ok(Arc::clone(&self.blobs) as Arc<dyn BlobStorage>)
    }
}

/// Temporary directory holding a database path.
pub(super) struct Workspace {
    _dir: TempDir,
    pub(super) root: Utf8PathBuf,
}

impl Workspace {
    pub(super) fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 workspace");
        Self { _dir: dir, root }
    }

    pub(super) fn database(&self) -> Utf8PathBuf {
        self.root.join("hubsync.db")
    }

    pub(super) fn write(&self, name: &str, contents: &str) -> Utf8PathBuf {
        let path = self.root.join(name);
        std::fs::write(&path, contents).expect("write file");
        path
    }
}
