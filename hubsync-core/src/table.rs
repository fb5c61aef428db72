//! Local table definitions and record normalization.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::{LocalRow, Scalar, SourceRecord};

/// Column added to every synced table holding the run timestamp.
pub const SYNCED_AT_COLUMN: &str = "synced_at";

/// Errors raised when a table definition is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableSpecError {
    /// A table or column name is not a plain SQL identifier.
    #[error("`{name}` is not a valid identifier")]
    InvalidIdentifier {
        /// Offending name.
        name: String,
    },
    /// A column was listed twice, or collides with the key or `synced_at`.
    #[error("column `{column}` is declared more than once in table `{table}`")]
    DuplicateColumn {
        /// Table being defined.
        table: String,
        /// Repeated column name.
        column: String,
    },
}

/// Errors raised when a single source record cannot be normalized.
///
/// These are per-record: the sync run skips the record and carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    /// The primary-key field is absent or null.
    #[error("record has no `{field}` primary key")]
    MissingPrimaryKey {
        /// Name of the primary-key field.
        field: String,
    },
    /// The primary-key field is present but not an integer or non-empty text.
    #[error("record primary key `{field}` has unsupported value {value}")]
    InvalidPrimaryKey {
        /// Name of the primary-key field.
        field: String,
        /// Offending JSON value.
        value: String,
    },
    /// The marker field is present but cannot be ordered.
    #[error(
        "record {key} has unsupported `{field}` marker {value}; markers must be \
         integers, whole-number floats or non-empty text"
    )]
    InvalidMarker {
        /// Name of the marker field.
        field: String,
        /// Primary key of the record.
        key: Scalar,
        /// Offending JSON value.
        value: String,
    },
}

/// Shape of a synced local table.
///
/// # Examples
/// ```
/// use hubsync_core::TableSpec;
///
/// let table = TableSpec::new("orders", "id", Some("updated_at"), ["amount", "status"])
///     .expect("valid table");
/// assert_eq!(table.name(), "orders");
/// assert!(TableSpec::new("orders; DROP", "id", None, ["x"]).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    name: String,
    primary_key: String,
    marker_field: Option<String>,
    columns: Vec<String>,
}

impl TableSpec {
    /// Define a table, validating every identifier.
    ///
    /// `columns` lists the retained non-key columns; the marker field is
    /// retained automatically when it is not already listed.
    ///
    /// # Errors
    /// Returns [`TableSpecError`] when a name is not a plain identifier or a
    /// column is declared twice.
    pub fn new<I, S>(
        name: impl Into<String>,
        primary_key: impl Into<String>,
        marker_field: Option<&str>,
        columns: I,
    ) -> Result<Self, TableSpecError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = Self::trusted(name, primary_key, marker_field, columns);
        spec.validate()?;
        Ok(spec)
    }

    /// Build a definition whose identifiers are known to be valid.
    pub(crate) fn trusted<I, S>(
        name: impl Into<String>,
        primary_key: impl Into<String>,
        marker_field: Option<&str>,
        columns: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if let Some(marker) = marker_field
            && !columns.iter().any(|column| column == marker)
        {
            columns.push(marker.to_owned());
        }
        Self {
            name: name.into(),
            primary_key: primary_key.into(),
            marker_field: marker_field.map(str::to_owned),
            columns,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), TableSpecError> {
        validate_identifier(&self.name)?;
        validate_identifier(&self.primary_key)?;
        let mut seen = vec![self.primary_key.as_str(), SYNCED_AT_COLUMN];
        for column in &self.columns {
            validate_identifier(column)?;
            if seen.contains(&column.as_str()) {
                return Err(TableSpecError::DuplicateColumn {
                    table: self.name.clone(),
                    column: column.clone(),
                });
            }
            seen.push(column);
        }
        Ok(())
    }

    /// Name of the local table.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field holding the primary key in both source records and local rows.
    #[must_use]
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Field used as the last-modified marker, if the source has one.
    #[must_use]
    pub fn marker_field(&self) -> Option<&str> {
        self.marker_field.as_deref()
    }

    /// Retained non-key columns.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Extract the primary key of a record.
    ///
    /// # Errors
    /// Returns [`RecordError`] when the key is missing or not a scalar.
    pub fn key_of(&self, record: &SourceRecord) -> Result<Scalar, RecordError> {
        let value = match record.get(&self.primary_key) {
            None | Some(Value::Null) => {
                return Err(RecordError::MissingPrimaryKey {
                    field: self.primary_key.clone(),
                });
            }
            Some(value) => value,
        };
        Scalar::from_value(value).ok_or_else(|| RecordError::InvalidPrimaryKey {
            field: self.primary_key.clone(),
            value: value.to_string(),
        })
    }

    /// Keyset position `(marker, key)` of a record.
    ///
    /// Returns `Ok(None)` when the table has no marker field or the record
    /// does not carry one.
    ///
    /// # Errors
    /// Returns [`RecordError`] when the key is invalid or the marker is
    /// present but not a scalar.
    pub fn position_of(
        &self,
        record: &SourceRecord,
    ) -> Result<Option<(Scalar, Scalar)>, RecordError> {
        let Some(field) = self.marker_field.as_deref() else {
            return Ok(None);
        };
        let key = self.key_of(record)?;
        match record.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => match Scalar::from_value(value) {
                Some(marker) => Ok(Some((marker, key))),
                None => Err(RecordError::InvalidMarker {
                    field: field.to_owned(),
                    key,
                    value: value.to_string(),
                }),
            },
        }
    }

    /// Map a source record onto this table's retained columns.
    ///
    /// # Errors
    /// Returns [`RecordError`] when the key or marker is unusable.
    pub fn normalize(&self, record: &SourceRecord, synced_at: i64) -> Result<LocalRow, RecordError> {
        let key = self.key_of(record)?;
        self.position_of(record)?;
        let columns: BTreeMap<String, Value> = self
            .columns
            .iter()
            .map(|column| {
                let value = record.get(column).cloned().unwrap_or(Value::Null);
                (column.clone(), value)
            })
            .collect();
        Ok(LocalRow {
            key,
            columns,
            synced_at,
        })
    }
}

/// Check that `name` is a plain SQL identifier.
///
/// # Errors
/// Returns [`TableSpecError::InvalidIdentifier`] otherwise.
pub fn validate_identifier(name: &str) -> Result<(), TableSpecError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_');
    if valid_head && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        Ok(())
    } else {
        Err(TableSpecError::InvalidIdentifier {
            name: name.to_owned(),
        })
    }
}
