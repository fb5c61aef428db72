//! Errors that end or degrade a sync run.

use std::time::Duration;

use thiserror::Error;

use crate::{CheckpointStoreError, Cursor, LocalStoreError, RemoteError, RunStatus};

/// Reason a sync run did not finish cleanly.
///
/// Every variant maps onto the [`RunStatus`] recorded for the run through
/// [`SyncError::status`].
#[derive(Debug, Error)]
pub enum SyncError {
    /// A transient remote failure persisted through every retry.
    #[error("remote source still failing after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made, including the first.
        attempts: u32,
        /// Last failure observed.
        #[source]
        source: RemoteError,
    },
    /// A page could not be decoded.
    #[error("remote source returned unusable data")]
    RemoteData {
        /// Decoding failure reported by the adapter.
        #[source]
        source: RemoteError,
    },
    /// Malformed records were skipped while the rest of the data was synced.
    #[error("skipped {skipped} malformed records")]
    SkippedRecords {
        /// Number of records skipped during the run.
        skipped: u64,
    },
    /// A page that was not the last one failed to move the cursor forward.
    #[error(
        "cursor did not advance past {cursor:?}{}",
        first_record_suffix(first_record.as_deref())
    )]
    CursorStalled {
        /// Cursor the run was stuck on.
        cursor: Cursor,
        /// First raw record of the page that failed to move it, as JSON.
        first_record: Option<String>,
    },
    /// Writing to the local store failed.
    #[error("local write failed")]
    LocalWrite(#[from] LocalStoreError),
    /// Reading or persisting a checkpoint failed.
    #[error("checkpoint update failed")]
    Checkpoint(#[from] CheckpointStoreError),
    /// The adapter rejected the request in a way retries cannot fix.
    #[error("remote adapter is misconfigured")]
    Configuration {
        /// Failure reported by the adapter.
        #[source]
        source: RemoteError,
    },
    /// The run was cancelled between pages.
    #[error("sync cancelled")]
    Cancelled,
    /// The run exceeded its time budget.
    #[error("sync exceeded its {timeout:?} time budget")]
    TimedOut {
        /// Configured time budget.
        timeout: Duration,
    },
    /// Another run of the same table is in progress.
    #[error("a sync of `{table}` is already running")]
    AlreadyRunning {
        /// Table being synced.
        table: String,
    },
    /// The run's lease expired and another run took the table over.
    #[error("lost the run lease on `{table}` to another sync")]
    LeaseLost {
        /// Table being synced.
        table: String,
    },
}

impl SyncError {
    /// Status recorded for a run that ended with this error.
    ///
    /// Local write failures and configuration problems fail the run; every
    /// other condition leaves resumable progress behind and is `partial`.
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        match self {
            Self::LocalWrite(_) | Self::Checkpoint(_) | Self::Configuration { .. } => {
                RunStatus::Failed
            }
            Self::RetriesExhausted { .. }
            | Self::RemoteData { .. }
            | Self::SkippedRecords { .. }
            | Self::CursorStalled { .. }
            | Self::Cancelled
            | Self::TimedOut { .. }
            | Self::AlreadyRunning { .. }
            | Self::LeaseLost { .. } => RunStatus::Partial,
        }
    }

    /// Classify a remote failure that will not be retried.
    pub(crate) fn from_remote(source: RemoteError) -> Self {
        match source {
            RemoteError::Malformed { .. } => Self::RemoteData { source },
            other => Self::Configuration { source: other },
        }
    }
}

fn first_record_suffix(raw: Option<&str>) -> String {
    raw.map(|raw| format!("; first record on the page: {raw}"))
        .unwrap_or_default()
}
