//! Schedule file format and validation.

use std::collections::BTreeSet;
use std::io::Read;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8};
use hubsync_core::SyncMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading a schedule or registering tables with it.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The schedule file could not be read.
    #[error("failed to read schedule file {path:?}")]
    Read {
        /// Path of the schedule file.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The schedule is not valid JSON for [`ScheduleConfig`].
    #[error("failed to parse schedule")]
    Parse {
        /// Source error returned by `serde_json`.
        #[source]
        source: serde_json::Error,
    },
    /// A table appears more than once.
    #[error("table {table} is scheduled more than once")]
    DuplicateTable {
        /// Repeated table name.
        table: String,
    },
    /// An enabled table has a zero interval.
    #[error("table {table} must have an interval of at least one second")]
    ZeroInterval {
        /// Offending table name.
        table: String,
    },
    /// A schedule was registered with a manager for a different table.
    #[error("schedule for {schedule} cannot drive the {manager} sync manager")]
    TableMismatch {
        /// Table named by the schedule.
        schedule: String,
        /// Table synced by the manager.
        manager: String,
    },
}

const fn enabled_by_default() -> bool {
    true
}

/// Schedule for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchedule {
    /// Local table name, e.g. `hubcheckout` or `cloudblob`.
    pub table: String,
    /// Whether the scheduler runs this table at all.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Seconds between the starts of consecutive runs.
    pub interval_secs: u64,
    /// Mode used for every scheduled run.
    #[serde(default)]
    pub mode: SyncMode,
}

impl TableSchedule {
    /// Enabled incremental schedule for `table` every `interval_secs`.
    #[must_use]
    pub fn every(table: impl Into<String>, interval_secs: u64) -> Self {
        Self {
            table: table.into(),
            enabled: true,
            interval_secs,
            mode: SyncMode::Incremental,
        }
    }

    /// Replace the run mode.
    #[must_use]
    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    /// Disable the table.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Period between runs.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Per-table schedules, usually loaded from a JSON file:
///
/// ```json
/// {
///   "tables": [
///     { "table": "hubtransaction", "interval_secs": 300 },
///     { "table": "cloudblob", "interval_secs": 3600, "mode": "from_scratch" },
///     { "table": "hubcheckouttracker", "interval_secs": 600, "enabled": false }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Table schedules.
    #[serde(default)]
    pub tables: Vec<TableSchedule>,
}

impl ScheduleConfig {
    /// Parse and validate a JSON schedule.
    ///
    /// # Errors
    /// Returns [`ScheduleError`] when the JSON is invalid or the schedule
    /// fails [`Self::validate`].
    ///
    /// # Examples
    /// ```
    /// use hubsync_data::schedule::ScheduleConfig;
    ///
    /// let config = ScheduleConfig::from_json(
    ///     r#"{"tables": [{"table": "hubcheckout", "interval_secs": 60}]}"#,
    /// )?;
    /// assert_eq!(config.enabled().count(), 1);
    /// # Ok::<(), hubsync_data::schedule::ScheduleError>(())
    /// ```
    pub fn from_json(text: &str) -> Result<Self, ScheduleError> {
        let config: Self =
            serde_json::from_str(text).map_err(|source| ScheduleError::Parse { source })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate the schedule file at `path`.
    ///
    /// # Errors
    /// Returns [`ScheduleError::Read`] when the file cannot be read, or the
    /// errors of [`Self::from_json`].
    pub fn load(path: &Utf8Path) -> Result<Self, ScheduleError> {
        let read_error = |source| ScheduleError::Read {
            path: path.to_path_buf(),
            source,
        };
        let mut file = fs_utf8::File::open_ambient(path, ambient_authority()).map_err(read_error)?;
        let mut text = String::new();
        file.read_to_string(&mut text).map_err(read_error)?;
        Self::from_json(&text)
    }

    /// Check that no table is listed twice and enabled tables have a
    /// non-zero interval.
    ///
    /// # Errors
    /// Returns the first [`ScheduleError`] found.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        let mut seen = BTreeSet::new();
        for schedule in &self.tables {
            if !seen.insert(schedule.table.as_str()) {
                return Err(ScheduleError::DuplicateTable {
                    table: schedule.table.clone(),
                });
            }
            if schedule.enabled && schedule.interval_secs == 0 {
                return Err(ScheduleError::ZeroInterval {
                    table: schedule.table.clone(),
                });
            }
        }
        Ok(())
    }

    /// Schedules of enabled tables.
    pub fn enabled(&self) -> impl Iterator<Item = &TableSchedule> {
        self.tables.iter().filter(|schedule| schedule.enabled)
    }
}
