//! Core synchronization engine for hubsync.
//!
//! The crate pulls records from remote sources into a local analytical store
//! and keeps enough state to make repeated runs safe:
//!
//! - [`EntityAdapter`] implementations describe one remote entity type and the
//!   table it lands in. [`CoreEntityAdapter`] covers the Core API entities,
//!   [`CloudBlobAdapter`] covers blob container listings.
//! - [`LocalStore`] upserts normalized rows, idempotent on primary key.
//! - [`CheckpointStore`] persists a [`SyncCheckpoint`] per table.
//! - [`SyncManager`] ties them together in incremental or from-scratch runs.
//! - [`reconcile`] compares local and remote counts without changing either.
//!
//! Enable the `store-sqlite` feature (on by default) for [`SqliteStore`].

#![forbid(unsafe_code)]

mod checkpoint;
mod cursor;
mod reconcile;
mod record;
mod source;
mod store;
mod sync;
mod table;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use checkpoint::{CheckpointStore, CheckpointStoreError, RunStatus, SyncCheckpoint, UnknownRunStatus};
pub use cursor::Cursor;
pub use reconcile::{ReconcileError, Reconciliation, reconcile};
pub use record::{LocalRow, Scalar, SourceRecord};
pub use source::cloud::{
    BlobEntry, BlobListing, BlobProperties, BlobStorage, CLOUD_BLOB_TABLE, CloudBlobAdapter,
    fetch_data_count,
};
pub use source::hub::{CORE_MARKER_FIELD, CoreClient, CoreEntity, CoreEntityAdapter, UnknownEntity};
pub use source::{EntityAdapter, Page, RemoteError};
pub use store::{LocalStore, LocalStoreError};
pub use sync::{
    DEFAULT_LEASE_TTL, DEFAULT_PAGE_SIZE, RetryPolicy, SyncError, SyncManager, SyncMode, SyncOptions, SyncRunResult,
    TableSync, UnknownSyncMode,
};
pub use table::{RecordError, SYNCED_AT_COLUMN, TableSpec, TableSpecError, validate_identifier};

#[cfg(feature = "store-sqlite")]
pub use store::{SqliteStore, SqliteStoreError, TableSummary};
