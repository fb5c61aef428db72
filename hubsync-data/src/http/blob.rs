//! [`BlobStorage`] over a JSON blob gateway.

use hubsync_core::{BlobListing, BlobProperties, BlobStorage, RemoteError};
use url::Url;

use super::config::{ClientBuildError, HttpClientConfig};
use super::transport::Transport;
use super::wire::{BlobListResponse, CountResponse};

/// HTTP client for one blob container behind a JSON gateway.
///
/// - `GET {base}/containers/{c}/blobs?maxresults=N&marker=T` returns
///   `{"blobs": [...], "next_marker": "..."}`.
/// - `GET {base}/containers/{c}/blobs/{name}/properties` returns the blob's
///   properties.
/// - `GET {base}/containers/{c}/count` returns `{"count": n}`.
#[derive(Debug)]
pub struct HttpBlobStorage {
    transport: Transport,
    container: String,
}

impl HttpBlobStorage {
    /// Create a client for `container` with explicit configuration.
    ///
    /// # Errors
    /// Returns [`ClientBuildError`] when the URL is unusable or the HTTP
    /// client or Tokio runtime fails to build.
    pub fn with_config(
        config: HttpClientConfig,
        container: impl Into<String>,
    ) -> Result<Self, ClientBuildError> {
        Ok(Self {
            transport: Transport::build(config)?,
            container: container.into(),
        })
    }

    fn list_url(&self, token: Option<&str>, page_size: usize) -> Result<Url, RemoteError> {
        let mut url = self
            .transport
            .endpoint(["containers", self.container.as_str(), "blobs"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("maxresults", &page_size.max(1).to_string());
            if let Some(token) = token {
                query.append_pair("marker", token);
            }
        }
        Ok(url)
    }

    fn properties_url(&self, name: &str) -> Result<Url, RemoteError> {
        self.transport.endpoint([
            "containers",
            self.container.as_str(),
            "blobs",
            name,
            "properties",
        ])
    }

    fn count_url(&self) -> Result<Url, RemoteError> {
        self.transport
            .endpoint(["containers", self.container.as_str(), "count"])
    }
}

impl BlobStorage for HttpBlobStorage {
    fn container(&self) -> &str {
        &self.container
    }

    fn list_blobs(&self, token: Option<&str>, page_size: usize) -> Result<BlobListing, RemoteError> {
        let operation = format!("list blobs in {}", self.container);
        let url = self.list_url(token, page_size)?;
        let response: BlobListResponse = self.transport.get_json(&operation, url)?;
        Ok(response.into())
    }

    fn fetch_blob_properties(&self, name: &str) -> Result<BlobProperties, RemoteError> {
        let operation = format!("read properties of {}/{name}", self.container);
        let url = self.properties_url(name)?;
        self.transport.get_json(&operation, url)
    }

    fn count_blobs(&self) -> Result<u64, RemoteError> {
        let operation = format!("count blobs in {}", self.container);
        let url = self.count_url()?;
        let response: CountResponse = self.transport.get_json(&operation, url)?;
        Ok(response.count)
    }
}
