//! Per-table sync checkpoints and the store that persists them.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Cursor;

/// Outcome of the most recent run recorded on a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The table has never been synced.
    #[default]
    NeverRun,
    /// The run reached the end of the data (or its page limit) cleanly.
    Success,
    /// The run stopped early or skipped records; the next run resumes.
    Partial,
    /// The run could not write locally or was misconfigured.
    Failed,
}

impl RunStatus {
    /// Stable lowercase label used in storage and reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NeverRun => "never_run",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a stored run status label is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown run status `{0}`")]
pub struct UnknownRunStatus(pub String);

impl FromStr for RunStatus {
    type Err = UnknownRunStatus;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        match label {
            "never_run" => Ok(Self::NeverRun),
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownRunStatus(other.to_owned())),
        }
    }
}

/// Durable record of how far a table has been synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    /// Table the checkpoint belongs to.
    pub table_name: String,
    /// Last committed position.
    pub cursor: Cursor,
    /// Outcome of the most recent run.
    pub last_run_status: RunStatus,
    /// Unix timestamp (seconds) of the most recent run.
    pub last_run_at: Option<i64>,
    /// Rows written by the most recent run.
    pub rows_written_last_run: u64,
}

impl SyncCheckpoint {
    /// Checkpoint for a table that has never been synced.
    #[must_use]
    pub fn never_run(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            cursor: Cursor::Start,
            last_run_status: RunStatus::NeverRun,
            last_run_at: None,
            rows_written_last_run: 0,
        }
    }
}

/// Errors raised by checkpoint stores.
#[derive(Debug, Error)]
pub enum CheckpointStoreError {
    /// SQLite rejected a checkpoint operation.
    #[cfg(feature = "store-sqlite")]
    #[error("checkpoint {operation} failed for `{table}`")]
    Sqlite {
        /// Operation being performed.
        operation: &'static str,
        /// Table whose checkpoint was involved.
        table: String,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// A stored checkpoint could not be decoded.
    #[error("stored checkpoint for `{table}` is corrupt: {message}")]
    Corrupt {
        /// Table whose checkpoint is unreadable.
        table: String,
        /// Description of the problem.
        message: String,
    },
    /// The cursor could not be encoded for storage.
    #[error("failed to encode cursor for `{table}`")]
    Encode {
        /// Table whose checkpoint was being written.
        table: String,
        /// Source error returned by `serde_json`.
        #[source]
        source: serde_json::Error,
    },
    /// The backing store is unavailable.
    #[error("checkpoint store unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },
}

/// Durable storage for [`SyncCheckpoint`]s, keyed by table name.
///
/// Implementations must make [`CheckpointStore::put`] atomic and be safe to
/// use concurrently for distinct tables.
///
/// The store also arbitrates run leases: at most one owner may hold the
/// lease of a table at a time, across every manager and process sharing the
/// store. A lease not renewed within its time to live may be taken over.
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for `table_name`, if one exists.
    ///
    /// # Errors
    /// Returns [`CheckpointStoreError`] when the store cannot be read.
    fn get(&self, table_name: &str) -> Result<Option<SyncCheckpoint>, CheckpointStoreError>;

    /// Replace the checkpoint stored for `checkpoint.table_name`.
    ///
    /// # Errors
    /// Returns [`CheckpointStoreError`] when the write fails; the previous
    /// checkpoint is then left intact.
    fn put(&self, checkpoint: &SyncCheckpoint) -> Result<(), CheckpointStoreError>;

    /// Return `table_name` to the start of its dataset.
    ///
    /// The last-run fields are preserved; only the cursor moves.
    ///
    /// # Errors
    /// Returns [`CheckpointStoreError`] when the write fails.
    fn reset(&self, table_name: &str) -> Result<(), CheckpointStoreError> {
        let mut checkpoint = self
            .get(table_name)?
            .unwrap_or_else(|| SyncCheckpoint::never_run(table_name));
        checkpoint.cursor = Cursor::Start;
        self.put(&checkpoint)
    }

    /// Claim or renew the run lease of `table_name` for `owner`.
    ///
    /// Returns `false`, leaving the lease untouched, while a different owner
    /// holds a lease acquired less than `ttl` ago.
    ///
    /// # Errors
    /// Returns [`CheckpointStoreError`] when the lease cannot be read or
    /// written.
    fn acquire_lease(
        &self,
        table_name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, CheckpointStoreError>;

    /// Drop `owner`'s lease on `table_name`. Leases held by other owners are
    /// left alone.
    ///
    /// # Errors
    /// Returns [`CheckpointStoreError`] when the lease cannot be removed.
    fn release_lease(&self, table_name: &str, owner: &str) -> Result<(), CheckpointStoreError>;
}

impl<S: CheckpointStore + ?Sized> CheckpointStore for Arc<S> {
    fn get(&self, table_name: &str) -> Result<Option<SyncCheckpoint>, CheckpointStoreError> {
        (**self).get(table_name)
    }

    fn put(&self, checkpoint: &SyncCheckpoint) -> Result<(), CheckpointStoreError> {
        (**self).put(checkpoint)
    }

    fn reset(&self, table_name: &str) -> Result<(), CheckpointStoreError> {
        (**self).reset(table_name)
    }

    fn acquire_lease(
        &self,
        table_name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, CheckpointStoreError> {
        (**self).acquire_lease(table_name, owner, ttl)
    }

    fn release_lease(&self, table_name: &str, owner: &str) -> Result<(), CheckpointStoreError> {
        (**self).release_lease(table_name, owner)
    }
}

/// Whether a lease taken by `holder` at `acquired_at` still excludes
/// `owner` at `now` (Unix seconds).
pub(crate) fn lease_excludes(
    holder: &str,
    acquired_at: i64,
    owner: &str,
    now: i64,
    ttl: Duration,
) -> bool {
    let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    holder != owner && now.saturating_sub(acquired_at) < ttl_secs
}

/// Current Unix time in whole seconds.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX)
        })
}
