//! Remote sources and the adapters that expose them to the sync manager.
//!
//! An [`EntityAdapter`] is the strategy object a [`crate::SyncManager`] is
//! parameterised with: it names the local table, counts the authoritative
//! records and fetches pages after a [`Cursor`]. Core entities and cloud
//! blobs each provide one.

use std::time::Duration;

use thiserror::Error;

use crate::{Cursor, LocalRow, RecordError, Scalar, SourceRecord, TableSpec};

pub mod cloud;
pub mod hub;

/// One page of records fetched from a source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Records ordered by `(marker, key)` strictly after the requested cursor.
    pub records: Vec<SourceRecord>,
    /// Cursor supplied by the source for the following page, if any.
    pub next_cursor: Option<Cursor>,
    /// The source has no more records after this page.
    pub is_last: bool,
}

impl Page {
    /// Create a page holding `records`.
    #[must_use]
    pub const fn new(records: Vec<SourceRecord>) -> Self {
        Self {
            records,
            next_cursor: None,
            is_last: false,
        }
    }

    /// Attach the source-provided cursor for the following page.
    #[must_use]
    pub fn with_next_cursor(mut self, cursor: Cursor) -> Self {
        self.next_cursor = Some(cursor);
        self
    }

    /// Mark the page as the final one.
    #[must_use]
    pub fn into_last(mut self) -> Self {
        self.is_last = true;
        self
    }

    /// Return `true` when the page carries no records.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Errors raised by remote sources.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RemoteError {
    /// The request exceeded its timeout.
    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Configured timeout in seconds.
        timeout_secs: u64,
    },
    /// The source asked the caller to slow down.
    #[error("{operation} was rate limited")]
    RateLimited {
        /// Operation that was throttled.
        operation: String,
        /// Delay requested by the source, if any.
        retry_after: Option<Duration>,
    },
    /// The source reported a server-side failure.
    #[error("{operation} failed with status {status}: {message}")]
    Unavailable {
        /// Operation that failed.
        operation: String,
        /// HTTP status code or equivalent.
        status: u16,
        /// Error text from the source.
        message: String,
    },
    /// The source could not be reached.
    #[error("{operation} failed: {message}")]
    Network {
        /// Operation that failed.
        operation: String,
        /// Error text from the transport.
        message: String,
    },
    /// The request was refused; retrying will not help.
    #[error("{operation} was rejected with status {status}: {message}")]
    Rejected {
        /// Operation that was refused.
        operation: String,
        /// HTTP status code or equivalent.
        status: u16,
        /// Error text from the source.
        message: String,
    },
    /// The requested resource does not exist.
    #[error("{operation} found nothing")]
    NotFound {
        /// Operation that found nothing.
        operation: String,
    },
    /// The source answered with data that could not be decoded.
    #[error("{operation} returned malformed data: {message}")]
    Malformed {
        /// Operation whose response was unusable.
        operation: String,
        /// Decoding failure.
        message: String,
    },
    /// The adapter was asked for something its configuration cannot serve.
    #[error("source misconfigured: {message}")]
    Misconfigured {
        /// Description of the problem.
        message: String,
    },
}

impl RemoteError {
    /// Return `true` for failures worth retrying with backoff.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::RateLimited { .. }
                | Self::Unavailable { .. }
                | Self::Network { .. }
        )
    }

    /// Delay requested by the source before the next attempt.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Strategy object binding one remote entity type to one local table.
pub trait EntityAdapter: Send + Sync {
    /// Local table the entity is synced into.
    fn table(&self) -> &TableSpec;

    /// Authoritative number of records at the source.
    ///
    /// # Errors
    /// Returns [`RemoteError`] when the source cannot be queried.
    fn count(&self) -> Result<u64, RemoteError>;

    /// Fetch up to `page_size` records after `cursor`.
    ///
    /// # Errors
    /// Returns [`RemoteError`] when the page cannot be fetched or decoded.
    fn fetch_page(&self, cursor: &Cursor, page_size: usize) -> Result<Page, RemoteError>;

    /// Map a source record to a local row.
    ///
    /// # Errors
    /// Returns [`RecordError`] when the record is malformed.
    fn normalize(&self, record: &SourceRecord, synced_at: i64) -> Result<LocalRow, RecordError> {
        self.table().normalize(record, synced_at)
    }

    /// Keyset position of a record, used to derive the next watermark.
    ///
    /// # Errors
    /// Returns [`RecordError`] when the key or marker is unusable.
    fn position(&self, record: &SourceRecord) -> Result<Option<(Scalar, Scalar)>, RecordError> {
        self.table().position_of(record)
    }
}

impl<A: EntityAdapter + ?Sized> EntityAdapter for Box<A> {
    fn table(&self) -> &TableSpec {
        (**self).table()
    }

    fn count(&self) -> Result<u64, RemoteError> {
        (**self).count()
    }

    fn fetch_page(&self, cursor: &Cursor, page_size: usize) -> Result<Page, RemoteError> {
        (**self).fetch_page(cursor, page_size)
    }

    fn normalize(&self, record: &SourceRecord, synced_at: i64) -> Result<LocalRow, RecordError> {
        (**self).normalize(record, synced_at)
    }

    fn position(&self, record: &SourceRecord) -> Result<Option<(Scalar, Scalar)>, RecordError> {
        (**self).position(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(RemoteError::Timeout { operation: "fetch".into(), timeout_secs: 5 }, true)]
    #[case(RemoteError::RateLimited { operation: "fetch".into(), retry_after: None }, true)]
    #[case(RemoteError::Unavailable { operation: "fetch".into(), status: 503, message: String::new() }, true)]
    #[case(RemoteError::Network { operation: "fetch".into(), message: String::new() }, true)]
    #[case(RemoteError::Rejected { operation: "fetch".into(), status: 401, message: String::new() }, false)]
    #[case(RemoteError::NotFound { operation: "fetch".into() }, false)]
    #[case(RemoteError::Malformed { operation: "fetch".into(), message: String::new() }, false)]
    #[case(RemoteError::Misconfigured { message: String::new() }, false)]
    fn classifies_transient_failures(#[case] error: RemoteError, #[case] transient: bool) {
        assert_eq!(error.is_transient(), transient);
    }

    #[rstest]
    fn exposes_requested_delay() {
        let error = RemoteError::RateLimited {
            operation: "fetch".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(error.retry_after(), Some(Duration::from_secs(3)));
    }
}
