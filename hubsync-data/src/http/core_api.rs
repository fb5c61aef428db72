//! [`CoreClient`] over the Core REST API.

use hubsync_core::{CoreClient, CoreEntity, Cursor, Page, RemoteError};
use url::Url;

use super::config::{ClientBuildError, HttpClientConfig};
use super::transport::Transport;
use super::wire::{CountResponse, RecordsResponse};

/// HTTP client for the Core entity endpoints.
///
/// - `GET {base}/api/{resource}/count` returns `{"count": n}`.
/// - `GET {base}/api/{resource}?limit=N&after_marker=M&after_key=K` returns
///   `{"records": [...], "has_more": bool}`.
///
/// Paging is keyset only: the watermark parameters are omitted on the first
/// page and continuation tokens are refused.
#[derive(Debug)]
pub struct HttpCoreClient {
    transport: Transport,
}

impl HttpCoreClient {
    /// Create a client for `base_url` with default settings.
    ///
    /// # Errors
    /// Returns [`ClientBuildError`] when the URL is unusable or the HTTP
    /// client or Tokio runtime fails to build.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientBuildError> {
        Self::with_config(HttpClientConfig::new(base_url))
    }

    /// Create a client with explicit configuration.
    ///
    /// # Errors
    /// Returns [`ClientBuildError`] when the URL is unusable or the HTTP
    /// client or Tokio runtime fails to build.
    pub fn with_config(config: HttpClientConfig) -> Result<Self, ClientBuildError> {
        Ok(Self {
            transport: Transport::build(config)?,
        })
    }

    fn count_url(&self, entity: CoreEntity) -> Result<Url, RemoteError> {
        self.transport.endpoint(["api", entity.resource(), "count"])
    }

    fn page_url(
        &self,
        entity: CoreEntity,
        cursor: &Cursor,
        page_size: usize,
    ) -> Result<Url, RemoteError> {
        let mut url = self.transport.endpoint(["api", entity.resource()])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &page_size.to_string());
            match cursor {
                Cursor::Start => {}
                Cursor::Watermark { marker, key } => {
                    query.append_pair("after_marker", &marker.to_string());
                    query.append_pair("after_key", &key.to_string());
                }
                Cursor::Token { .. } => {
                    return Err(RemoteError::Misconfigured {
                        message: format!(
                            "{} is paged by watermark, not by token",
                            entity.resource()
                        ),
                    });
                }
            }
        }
        Ok(url)
    }
}

impl CoreClient for HttpCoreClient {
    fn count(&self, entity: CoreEntity) -> Result<u64, RemoteError> {
        let operation = format!("count {}", entity.resource());
        let url = self.count_url(entity)?;
        let response: CountResponse = self.transport.get_json(&operation, url)?;
        Ok(response.count)
    }

    fn fetch_page(
        &self,
        entity: CoreEntity,
        cursor: &Cursor,
        page_size: usize,
    ) -> Result<Page, RemoteError> {
        let operation = format!("fetch {}", entity.resource());
        let url = self.page_url(entity, cursor, page_size)?;
        let response: RecordsResponse = self.transport.get_json(&operation, url)?;
        Ok(response.into_page(&operation))
    }
}
