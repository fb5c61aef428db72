//! Response bodies of the Core API and the blob gateway.

use hubsync_core::{BlobEntry, BlobListing, Page, SourceRecord};
use log::warn;
use serde::Deserialize;
use serde_json::Value;

/// `GET …/count` response.
#[derive(Debug, Deserialize)]
pub(crate) struct CountResponse {
    /// Authoritative number of records.
    pub count: u64,
}

/// Page of Core records.
///
/// Records arrive ordered by `(updated_at, id)` strictly after the requested
/// watermark. `has_more` is `false` on the final page.
#[derive(Debug, Deserialize)]
pub(crate) struct RecordsResponse {
    pub records: Vec<Value>,
    #[serde(default)]
    pub has_more: bool,
}

impl RecordsResponse {
    /// Convert into a [`Page`].
    ///
    /// Entries that are not JSON objects are kept as empty records so the
    /// sync manager skips and counts them.
    pub(crate) fn into_page(self, operation: &str) -> Page {
        let records = self
            .records
            .into_iter()
            .map(|value| {
                SourceRecord::from_value(value).unwrap_or_else(|| {
                    warn!("{operation}: record is not a JSON object");
                    SourceRecord::default()
                })
            })
            .collect();
        let page = Page::new(records);
        if self.has_more { page } else { page.into_last() }
    }
}

/// Page of a container listing.
#[derive(Debug, Deserialize)]
pub(crate) struct BlobListResponse {
    #[serde(default)]
    pub blobs: Vec<BlobEntry>,
    #[serde(default)]
    pub next_marker: Option<String>,
}

impl From<BlobListResponse> for BlobListing {
    fn from(response: BlobListResponse) -> Self {
        Self {
            entries: response.blobs,
            next_token: response.next_marker.filter(|marker| !marker.is_empty()),
        }
    }
}
