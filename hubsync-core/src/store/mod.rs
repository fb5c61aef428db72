//! Local analytical store abstraction.

use std::sync::Arc;

use thiserror::Error;

use crate::{LocalRow, TableSpec, TableSpecError};

#[cfg(feature = "store-sqlite")]
mod sqlite;

#[cfg(feature = "store-sqlite")]
pub use sqlite::{SqliteStore, SqliteStoreError, TableSummary};

/// Errors raised by local stores.
#[derive(Debug, Error)]
pub enum LocalStoreError {
    /// A table name was rejected before reaching SQL.
    #[error(transparent)]
    InvalidTable(#[from] TableSpecError),
    /// SQLite rejected an operation.
    #[cfg(feature = "store-sqlite")]
    #[error("{operation} failed for table `{table}`")]
    Sqlite {
        /// Operation being performed.
        operation: &'static str,
        /// Table involved.
        table: String,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// A column value could not be encoded.
    #[error("failed to encode column `{column}` of table `{table}`")]
    Encode {
        /// Table being written.
        table: String,
        /// Column whose value failed to encode.
        column: String,
        /// Source error returned by `serde_json`.
        #[source]
        source: serde_json::Error,
    },
    /// The backing store is unavailable.
    #[error("local store unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },
}

/// Writer for synced tables.
///
/// Writes are idempotent on the primary key and every
/// [`LocalStore::upsert_batch`] call is all-or-nothing. Implementations must
/// be safe to use concurrently for distinct tables.
pub trait LocalStore: Send + Sync {
    /// Create `table` when it does not exist yet.
    ///
    /// Existing tables are left untouched.
    ///
    /// # Errors
    /// Returns [`LocalStoreError`] when the table cannot be created.
    fn ensure_table(&self, table: &TableSpec) -> Result<(), LocalStoreError>;

    /// Insert or overwrite `rows` in `table`, keyed by primary key.
    ///
    /// # Errors
    /// Returns [`LocalStoreError`] when any row fails; none are kept then.
    fn upsert_batch(&self, table: &TableSpec, rows: &[LocalRow]) -> Result<(), LocalStoreError>;

    /// Remove every row from `table_name`. Missing tables are ignored.
    ///
    /// # Errors
    /// Returns [`LocalStoreError`] when the rows cannot be removed.
    fn clear_table(&self, table_name: &str) -> Result<(), LocalStoreError>;

    /// Number of rows in `table_name`, or zero when it does not exist.
    ///
    /// # Errors
    /// Returns [`LocalStoreError`] when the count cannot be read.
    fn count(&self, table_name: &str) -> Result<u64, LocalStoreError>;

    /// Return `true` when `table_name` exists.
    ///
    /// # Errors
    /// Returns [`LocalStoreError`] when the catalogue cannot be read.
    fn table_exists(&self, table_name: &str) -> Result<bool, LocalStoreError>;
}

impl<S: LocalStore + ?Sized> LocalStore for Arc<S> {
    fn ensure_table(&self, table: &TableSpec) -> Result<(), LocalStoreError> {
        (**self).ensure_table(table)
    }

    fn upsert_batch(&self, table: &TableSpec, rows: &[LocalRow]) -> Result<(), LocalStoreError> {
        (**self).upsert_batch(table, rows)
    }

    fn clear_table(&self, table_name: &str) -> Result<(), LocalStoreError> {
        (**self).clear_table(table_name)
    }

    fn count(&self, table_name: &str) -> Result<u64, LocalStoreError> {
        (**self).count(table_name)
    }

    fn table_exists(&self, table_name: &str) -> Result<bool, LocalStoreError> {
        (**self).table_exists(table_name)
    }
}
