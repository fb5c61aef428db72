//! Cloud blob listings synced into the `cloudblob` table.
//!
//! Listings are paged with continuation tokens rather than watermarks. When a
//! listing is exhausted the committed cursor returns to [`Cursor::Start`], so
//! the following run relists the container and upserts whatever changed.

use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EntityAdapter, Page, RemoteError};
use crate::{Cursor, SourceRecord, TableSpec};

/// Local table receiving blob metadata.
pub const CLOUD_BLOB_TABLE: &str = "cloudblob";

const CLOUD_BLOB_COLUMNS: [&str; 7] = [
    "container",
    "size",
    "content_type",
    "last_modified",
    "etag",
    "content_md5",
    "properties_fetched",
];

/// Entry returned by a blob listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobEntry {
    /// Blob name, unique within its container.
    pub name: String,
    /// Size in bytes, when the listing includes it.
    #[serde(default)]
    pub size: Option<u64>,
    /// Content type, when the listing includes it.
    #[serde(default)]
    pub content_type: Option<String>,
    /// Last modification time as reported by the store.
    #[serde(default)]
    pub last_modified: Option<String>,
    /// Entity tag, when the listing includes it.
    #[serde(default)]
    pub etag: Option<String>,
}

/// One page of a blob listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobListing {
    /// Entries on this page.
    pub entries: Vec<BlobEntry>,
    /// Token for the next page; `None` once the listing is complete.
    pub next_token: Option<String>,
}

/// Detailed properties of a single blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobProperties {
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub last_modified: String,
    /// Content type.
    #[serde(default)]
    pub content_type: Option<String>,
    /// Base64 MD5 digest of the content.
    #[serde(default)]
    pub content_md5: Option<String>,
    /// Entity tag.
    #[serde(default)]
    pub etag: Option<String>,
}

/// Listing and property access to one blob container.
pub trait BlobStorage: Send + Sync {
    /// Name of the container being listed.
    fn container(&self) -> &str;

    /// List up to `page_size` blobs, continuing from `token` when given.
    ///
    /// # Errors
    /// Returns [`RemoteError`] when the listing fails.
    fn list_blobs(&self, token: Option<&str>, page_size: usize) -> Result<BlobListing, RemoteError>;

    /// Fetch the properties of the blob called `name`.
    ///
    /// # Errors
    /// Returns [`RemoteError::NotFound`] when the blob no longer exists, or
    /// another [`RemoteError`] when the request fails.
    fn fetch_blob_properties(&self, name: &str) -> Result<BlobProperties, RemoteError>;

    /// Authoritative number of blobs in the container.
    ///
    /// # Errors
    /// Returns [`RemoteError`] when the count cannot be obtained.
    fn count_blobs(&self) -> Result<u64, RemoteError>;
}

impl<S: BlobStorage + ?Sized> BlobStorage for Arc<S> {
    fn container(&self) -> &str {
        (**self).container()
    }

    fn list_blobs(&self, token: Option<&str>, page_size: usize) -> Result<BlobListing, RemoteError> {
        (**self).list_blobs(token, page_size)
    }

    fn fetch_blob_properties(&self, name: &str) -> Result<BlobProperties, RemoteError> {
        (**self).fetch_blob_properties(name)
    }

    fn count_blobs(&self) -> Result<u64, RemoteError> {
        (**self).count_blobs()
    }
}

/// Return the number of blobs in `storage` without touching local state.
///
/// # Errors
/// Returns [`RemoteError`] when the count cannot be obtained.
pub fn fetch_data_count<S: BlobStorage + ?Sized>(storage: &S) -> Result<u64, RemoteError> {
    storage.count_blobs()
}

/// Adapter syncing a blob container into [`CLOUD_BLOB_TABLE`].
#[derive(Debug, Clone)]
pub struct CloudBlobAdapter<S> {
    storage: S,
    query_blob_properties: bool,
    table: TableSpec,
}

impl<S: BlobStorage> CloudBlobAdapter<S> {
    /// Wrap `storage`. Properties are not queried unless enabled with
    /// [`Self::with_blob_properties`].
    #[must_use]
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            query_blob_properties: false,
            table: cloud_blob_table(),
        }
    }

    /// Fetch per-blob properties before each entry is written.
    #[must_use]
    pub fn with_blob_properties(mut self, enabled: bool) -> Self {
        self.query_blob_properties = enabled;
        self
    }

    /// Return `true` when per-blob properties are fetched.
    #[must_use]
    pub const fn queries_blob_properties(&self) -> bool {
        self.query_blob_properties
    }

    /// Borrow the wrapped storage.
    #[must_use]
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    fn entry_record(&self, entry: &BlobEntry) -> Result<SourceRecord, RemoteError> {
        let mut record = SourceRecord::default();
        record.insert("name", Value::String(entry.name.clone()));
        record.insert("container", Value::String(self.storage.container().to_owned()));
        record.insert("size", entry.size.map_or(Value::Null, Value::from));
        record.insert("content_type", optional_text(entry.content_type.as_ref()));
        record.insert("last_modified", optional_text(entry.last_modified.as_ref()));
        record.insert("etag", optional_text(entry.etag.as_ref()));
        record.insert("properties_fetched", Value::Bool(false));
        if !self.query_blob_properties {
            return Ok(record);
        }

        match self.storage.fetch_blob_properties(&entry.name) {
            Ok(properties) => {
                record.insert("size", Value::from(properties.size));
                record.insert("last_modified", Value::String(properties.last_modified));
                if properties.content_type.is_some() {
                    record.insert("content_type", optional_text(properties.content_type.as_ref()));
                }
                record.insert("content_md5", optional_text(properties.content_md5.as_ref()));
                if properties.etag.is_some() {
                    record.insert("etag", optional_text(properties.etag.as_ref()));
                }
                record.insert("properties_fetched", Value::Bool(true));
                Ok(record)
            }
            Err(RemoteError::NotFound { .. }) => {
                warn!(
                    "blob {} disappeared before its properties could be read",
                    entry.name
                );
                Ok(record)
            }
            Err(err) => Err(err),
        }
    }
}

impl<S: BlobStorage> EntityAdapter for CloudBlobAdapter<S> {
    fn table(&self) -> &TableSpec {
        &self.table
    }

    fn count(&self) -> Result<u64, RemoteError> {
        fetch_data_count(&self.storage)
    }

    fn fetch_page(&self, cursor: &Cursor, page_size: usize) -> Result<Page, RemoteError> {
        let token = match cursor {
            Cursor::Start => None,
            Cursor::Token { token } => Some(token.as_str()),
            Cursor::Watermark { .. } => {
                return Err(RemoteError::Misconfigured {
                    message: "blob listings cannot resume from a watermark".to_owned(),
                });
            }
        };
        let listing = self.storage.list_blobs(token, page_size)?;
        let records = listing
            .entries
            .iter()
            .map(|entry| self.entry_record(entry))
            .collect::<Result<Vec<_>, _>>()?;

        let page = Page::new(records);
        Ok(match listing.next_token {
            Some(next) => page.with_next_cursor(Cursor::token(next)),
            None => page.with_next_cursor(Cursor::Start).into_last(),
        })
    }
}

fn cloud_blob_table() -> TableSpec {
    TableSpec::trusted(CLOUD_BLOB_TABLE, "name", None, CLOUD_BLOB_COLUMNS)
}

fn optional_text(value: Option<&String>) -> Value {
    value.map_or(Value::Null, |text| Value::String(text.clone()))
}
