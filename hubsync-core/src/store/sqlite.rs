//! SQLite-backed local store and checkpoint store.
//!
//! A single database file holds every synced table plus the
//! `sync_checkpoints` and `sync_leases` tables. Connections are opened per operation with a
//! busy timeout, so concurrent managers for different tables can share one
//! [`SqliteStore`] and no handle outlives the call that opened it.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8};
use log::debug;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::{LocalStore, LocalStoreError};
use crate::checkpoint::{lease_excludes, unix_now};
use crate::table::{SYNCED_AT_COLUMN, validate_identifier};
use crate::{
    CheckpointStore, CheckpointStoreError, Cursor, LocalRow, RunStatus, Scalar, SyncCheckpoint,
    TableSpec, TableSpecError,
};

/// Table holding one checkpoint row per synced table.
pub const CHECKPOINT_TABLE: &str = "sync_checkpoints";

/// Table holding the run lease of every table being synced.
pub const LEASE_TABLE: &str = "sync_leases";

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while opening a [`SqliteStore`].
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// Failed to create the parent directory for the database.
    #[error("failed to create parent directory {path:?}")]
    CreateDirectory {
        /// Path of the directory that could not be created.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Opening the SQLite database failed.
    #[error("failed to open SQLite database at {path:?}")]
    Open {
        /// Database path.
        path: Utf8PathBuf,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// Creating the checkpoint or lease table failed.
    #[error("failed to create the sync_checkpoints and sync_leases tables")]
    CreateSchema {
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
}

/// Row count of one synced table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    /// Table name.
    pub name: String,
    /// Number of rows currently stored.
    pub rows: u64,
}

/// Local store and checkpoint store backed by one SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: Utf8PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    ///
    /// Parent directories are created and the checkpoint and lease tables
    /// are initialised.
    ///
    /// # Errors
    /// Returns [`SqliteStoreError`] when the directory, database or schema
    /// cannot be created.
    pub fn open(path: impl AsRef<Utf8Path>) -> Result<Self, SqliteStoreError> {
        let path = path.as_ref();
        ensure_parent_dir(path)?;
        let store = Self {
            path: path.to_path_buf(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        };
        let connection = store.connect().map_err(|source| SqliteStoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        connection
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS sync_checkpoints (
                    table_name TEXT PRIMARY KEY NOT NULL,
                    cursor TEXT NOT NULL,
                    last_run_status TEXT NOT NULL,
                    last_run_at INTEGER,
                    rows_written_last_run INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS sync_leases (
                    table_name TEXT PRIMARY KEY NOT NULL,
                    owner TEXT NOT NULL,
                    acquired_at INTEGER NOT NULL
                );",
            )
            .map_err(|source| SqliteStoreError::CreateSchema { source })?;
        Ok(store)
    }

    /// Override how long an operation waits on a locked database.
    #[must_use]
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Location of the database file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// List every synced table with its row count, ordered by name.
    ///
    /// # Errors
    /// Returns [`LocalStoreError`] when the catalogue or a count cannot be
    /// read.
    pub fn table_summaries(&self) -> Result<Vec<TableSummary>, LocalStoreError> {
        let connection = self.connect().map_err(local_error("open", "*"))?;
        let mut statement = connection
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                   AND name NOT IN (?1, ?2)
                 ORDER BY name",
            )
            .map_err(local_error("list tables", "*"))?;
        let names = statement
            .query_map([CHECKPOINT_TABLE, LEASE_TABLE], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(local_error("list tables", "*"))?;

        names
            .into_iter()
            .map(|name| -> Result<TableSummary, LocalStoreError> {
                let rows = count_rows(&connection, &name)?;
                Ok(TableSummary { name, rows })
            })
            .collect()
    }

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        let connection = Connection::open(self.path.as_std_path())?;
        connection.busy_timeout(self.busy_timeout)?;
        Ok(connection)
    }
}

impl LocalStore for SqliteStore {
    fn ensure_table(&self, table: &TableSpec) -> Result<(), LocalStoreError> {
        reject_reserved(table.name())?;
        let connection = self.connect().map_err(local_error("open", table.name()))?;
        connection
            .execute(&create_table_sql(table), [])
            .map_err(local_error("create table", table.name()))?;
        Ok(())
    }

    fn upsert_batch(&self, table: &TableSpec, rows: &[LocalRow]) -> Result<(), LocalStoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let name = table.name();
        reject_reserved(name)?;
        let mut connection = self.connect().map_err(local_error("open", name))?;
        let transaction = connection
            .transaction()
            .map_err(local_error("begin upsert", name))?;
        {
            let mut statement = transaction
                .prepare(&upsert_sql(table))
                .map_err(local_error("prepare upsert", name))?;
            for row in rows {
                let values = row_values(table, row)?;
                statement
                    .execute(params_from_iter(values.iter()))
                    .map_err(local_error("upsert row", name))?;
            }
        }
        transaction
            .commit()
            .map_err(local_error("commit upsert", name))?;
        debug!("upserted {} rows into {name}", rows.len());
        Ok(())
    }

    fn clear_table(&self, table_name: &str) -> Result<(), LocalStoreError> {
        validate_identifier(table_name)?;
        reject_reserved(table_name)?;
        let connection = self.connect().map_err(local_error("open", table_name))?;
        if !table_present(&connection, table_name)? {
            return Ok(());
        }
        connection
            .execute(&format!("DELETE FROM \"{table_name}\""), [])
            .map_err(local_error("clear table", table_name))?;
        Ok(())
    }

    fn count(&self, table_name: &str) -> Result<u64, LocalStoreError> {
        validate_identifier(table_name)?;
        let connection = self.connect().map_err(local_error("open", table_name))?;
        if !table_present(&connection, table_name)? {
            return Ok(0);
        }
        count_rows(&connection, table_name)
    }

    fn table_exists(&self, table_name: &str) -> Result<bool, LocalStoreError> {
        validate_identifier(table_name)?;
        let connection = self.connect().map_err(local_error("open", table_name))?;
        table_present(&connection, table_name)
    }
}

impl CheckpointStore for SqliteStore {
    fn get(&self, table_name: &str) -> Result<Option<SyncCheckpoint>, CheckpointStoreError> {
        let connection = self
            .connect()
            .map_err(checkpoint_error("open", table_name))?;
        let stored = connection
            .query_row(
                "SELECT cursor, last_run_status, last_run_at, rows_written_last_run
                 FROM sync_checkpoints WHERE table_name = ?1",
                [table_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(checkpoint_error("read", table_name))?;

        let Some((cursor, status, last_run_at, rows_written)) = stored else {
            return Ok(None);
        };
        let corrupt = |message: String| CheckpointStoreError::Corrupt {
            table: table_name.to_owned(),
            message,
        };
        Ok(Some(SyncCheckpoint {
            table_name: table_name.to_owned(),
            cursor: Cursor::from_json(&cursor).map_err(|err| corrupt(err.to_string()))?,
            last_run_status: status
                .parse::<RunStatus>()
                .map_err(|err| corrupt(err.to_string()))?,
            last_run_at,
            rows_written_last_run: u64::try_from(rows_written)
                .map_err(|_| corrupt(format!("negative row count {rows_written}")))?,
        }))
    }

    fn put(&self, checkpoint: &SyncCheckpoint) -> Result<(), CheckpointStoreError> {
        let table = checkpoint.table_name.as_str();
        let cursor = checkpoint
            .cursor
            .to_json()
            .map_err(|source| CheckpointStoreError::Encode {
                table: table.to_owned(),
                source,
            })?;
        let rows_written = i64::try_from(checkpoint.rows_written_last_run).unwrap_or(i64::MAX);

        let mut connection = self.connect().map_err(checkpoint_error("open", table))?;
        let transaction = connection
            .transaction()
            .map_err(checkpoint_error("begin", table))?;
        transaction
            .execute(
                "INSERT OR REPLACE INTO sync_checkpoints
                    (table_name, cursor, last_run_status, last_run_at, rows_written_last_run)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    table,
                    cursor,
                    checkpoint.last_run_status.as_str(),
                    checkpoint.last_run_at,
                    rows_written
                ],
            )
            .map_err(checkpoint_error("write", table))?;
        transaction
            .commit()
            .map_err(checkpoint_error("commit", table))
    }

    fn acquire_lease(
        &self,
        table_name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, CheckpointStoreError> {
        let mut connection = self
            .connect()
            .map_err(checkpoint_error("open", table_name))?;
        // IMMEDIATE holds the write lock across the read and the claim.
        let transaction = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(checkpoint_error("begin lease", table_name))?;
        let holder = transaction
            .query_row(
                "SELECT owner, acquired_at FROM sync_leases WHERE table_name = ?1",
                [table_name],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .map_err(checkpoint_error("read lease", table_name))?;

        let now = unix_now();
        if let Some((holder, acquired_at)) = holder
            && lease_excludes(&holder, acquired_at, owner, now, ttl)
        {
            debug!("{table_name}: lease held by {holder}");
            return Ok(false);
        }
        transaction
            .execute(
                "INSERT OR REPLACE INTO sync_leases (table_name, owner, acquired_at)
                 VALUES (?1, ?2, ?3)",
                params![table_name, owner, now],
            )
            .map_err(checkpoint_error("write lease", table_name))?;
        transaction
            .commit()
            .map_err(checkpoint_error("commit lease", table_name))?;
        Ok(true)
    }

    fn release_lease(&self, table_name: &str, owner: &str) -> Result<(), CheckpointStoreError> {
        let connection = self
            .connect()
            .map_err(checkpoint_error("open", table_name))?;
        connection
            .execute(
                "DELETE FROM sync_leases WHERE table_name = ?1 AND owner = ?2",
                params![table_name, owner],
            )
            .map_err(checkpoint_error("release lease", table_name))?;
        Ok(())
    }
}

fn local_error(
    operation: &'static str,
    table: &str,
) -> impl FnOnce(rusqlite::Error) -> LocalStoreError {
    move |source| LocalStoreError::Sqlite {
        operation,
        table: table.to_owned(),
        source,
    }
}

fn checkpoint_error(
    operation: &'static str,
    table: &str,
) -> impl FnOnce(rusqlite::Error) -> CheckpointStoreError {
    move |source| CheckpointStoreError::Sqlite {
        operation,
        table: table.to_owned(),
        source,
    }
}

fn reject_reserved(table_name: &str) -> Result<(), LocalStoreError> {
    if table_name.eq_ignore_ascii_case(CHECKPOINT_TABLE)
        || table_name.eq_ignore_ascii_case(LEASE_TABLE)
    {
        return Err(LocalStoreError::InvalidTable(
            TableSpecError::InvalidIdentifier {
                name: table_name.to_owned(),
            },
        ));
    }
    Ok(())
}

fn table_present(connection: &Connection, table_name: &str) -> Result<bool, LocalStoreError> {
    connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get::<_, bool>(0),
        )
        .map_err(local_error("inspect catalogue", table_name))
}

fn count_rows(connection: &Connection, table_name: &str) -> Result<u64, LocalStoreError> {
    let rows: i64 = connection
        .query_row(&format!("SELECT COUNT(*) FROM \"{table_name}\""), [], |row| {
            row.get(0)
        })
        .map_err(local_error("count rows", table_name))?;
    Ok(u64::try_from(rows).unwrap_or_default())
}

fn quoted_columns(table: &TableSpec) -> Vec<String> {
    std::iter::once(table.primary_key())
        .chain(table.columns().iter().map(String::as_str))
        .chain(std::iter::once(SYNCED_AT_COLUMN))
        .map(|column| format!("\"{column}\""))
        .collect()
}

fn create_table_sql(table: &TableSpec) -> String {
    let mut definitions = vec![format!("\"{}\" PRIMARY KEY NOT NULL", table.primary_key())];
    definitions.extend(table.columns().iter().map(|column| format!("\"{column}\"")));
    definitions.push(format!("\"{SYNCED_AT_COLUMN}\" INTEGER NOT NULL"));
    format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
        table.name(),
        definitions.join(", ")
    )
}

fn upsert_sql(table: &TableSpec) -> String {
    let columns = quoted_columns(table);
    let placeholders: Vec<String> = (1..=columns.len()).map(|index| format!("?{index}")).collect();
    format!(
        "INSERT OR REPLACE INTO \"{}\" ({}) VALUES ({})",
        table.name(),
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn row_values(table: &TableSpec, row: &LocalRow) -> Result<Vec<SqlValue>, LocalStoreError> {
    let mut values = Vec::with_capacity(table.columns().len() + 2);
    values.push(match &row.key {
        Scalar::Int(value) => SqlValue::Integer(*value),
        Scalar::Text(value) => SqlValue::Text(value.clone()),
    });
    for column in table.columns() {
        let value = match row.columns.get(column) {
            Some(value) => json_to_sql(table.name(), column, value)?,
            None => SqlValue::Null,
        };
        values.push(value);
    }
    values.push(SqlValue::Integer(row.synced_at));
    Ok(values)
}

fn json_to_sql(table: &str, column: &str, value: &Value) -> Result<SqlValue, LocalStoreError> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => number.as_i64().map_or_else(
            || {
                number
                    .as_f64()
                    .map_or_else(|| SqlValue::Text(number.to_string()), SqlValue::Real)
            },
            SqlValue::Integer,
        ),
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Array(_) | Value::Object(_) => {
            SqlValue::Text(serde_json::to_string(value).map_err(|source| {
                LocalStoreError::Encode {
                    table: table.to_owned(),
                    column: column.to_owned(),
                    source,
                }
            })?)
        }
    })
}

fn ensure_parent_dir(path: &Utf8Path) -> Result<(), SqliteStoreError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_str().is_empty() || parent == Utf8Path::new("/") {
        return Ok(());
    }

    let (base, relative) = if parent.is_absolute() {
        ("/", parent.strip_prefix("/").unwrap_or(parent))
    } else {
        (".", parent)
    };
    let create_error = |source| SqliteStoreError::CreateDirectory {
        path: parent.to_path_buf(),
        source,
    };
    let dir = fs_utf8::Dir::open_ambient_dir(base, ambient_authority()).map_err(create_error)?;
    dir.create_dir_all(relative).map_err(create_error)
}
