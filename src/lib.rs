//! Facade crate for the hubsync ingestion engine.
//!
//! This crate re-exports the core synchronization types and exposes the
//! SQLite store and HTTP adapters behind feature flags.

#![forbid(unsafe_code)]

pub use hubsync_core::{
    BlobEntry, BlobListing, BlobProperties, BlobStorage, CheckpointStore, CheckpointStoreError,
    CloudBlobAdapter, CoreClient, CoreEntity, CoreEntityAdapter, Cursor, EntityAdapter,
    LocalRow, LocalStore, LocalStoreError, Page, Reconciliation, ReconcileError, RecordError,
    RemoteError, RetryPolicy, RunStatus, Scalar, SourceRecord, SyncCheckpoint, SyncError,
    SyncManager, SyncMode, SyncOptions, SyncRunResult, TableSpec, TableSpecError, TableSync,
    fetch_data_count, reconcile,
};

#[cfg(feature = "store-sqlite")]
pub use hubsync_core::{SqliteStore, SqliteStoreError, TableSummary};

#[cfg(feature = "http")]
pub use hubsync_data::{
    http::{ClientBuildError, HttpBlobStorage, HttpClientConfig, HttpCoreClient},
    schedule::{ScheduleConfig, ScheduleError, Scheduler, TableActivity, TableSchedule},
};
