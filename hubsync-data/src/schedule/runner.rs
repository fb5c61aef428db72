//! Interval-driven execution of registered sync managers.

use std::sync::Arc;

use hubsync_core::{RunStatus, SyncError, SyncRunResult, TableSync};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::config::{ScheduleError, TableSchedule};

/// What the scheduler did for one table before it shut down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableActivity {
    /// Table driven.
    pub table: String,
    /// Runs that started and produced a result.
    pub runs: u64,
    /// Ticks skipped because another run of the table was in progress.
    pub overlaps_skipped: u64,
    /// Runs that did not end with [`RunStatus::Success`], including runs
    /// whose blocking task panicked.
    pub unsuccessful_runs: u64,
    /// Status of the most recent run.
    pub last_status: Option<RunStatus>,
}

impl TableActivity {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_owned(),
            runs: 0,
            overlaps_skipped: 0,
            unsuccessful_runs: 0,
            last_status: None,
        }
    }

    fn record(&mut self, result: &SyncRunResult) {
        self.runs += 1;
        if !result.is_success() {
            self.unsuccessful_runs += 1;
        }
        self.last_status = Some(result.final_status);
    }
}

struct Entry {
    schedule: TableSchedule,
    manager: Arc<dyn TableSync>,
}

/// Drives sync managers on per-table intervals.
///
/// Each enabled table gets its own Tokio task and [`tokio::time::interval`].
/// Ticks that fall behind are skipped rather than bunched up, and every run
/// executes on the blocking pool through [`TableSync::try_run_sync`], so a
/// table that is already busy (for example with a manual run) simply skips a
/// tick. Failed runs are logged; the next tick tries again.
#[derive(Default)]
pub struct Scheduler {
    entries: Vec<Entry>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tables", &self.tables().collect::<Vec<_>>())
            .finish()
    }
}

impl Scheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `manager` under `schedule`.
    ///
    /// # Errors
    /// Returns [`ScheduleError::TableMismatch`] when the manager syncs a
    /// different table than the schedule names, and
    /// [`ScheduleError::DuplicateTable`] when the table is already
    /// registered.
    pub fn register(
        &mut self,
        schedule: TableSchedule,
        manager: Arc<dyn TableSync>,
    ) -> Result<(), ScheduleError> {
        if manager.table_name() != schedule.table {
            return Err(ScheduleError::TableMismatch {
                schedule: schedule.table,
                manager: manager.table_name().to_owned(),
            });
        }
        if self
            .entries
            .iter()
            .any(|entry| entry.schedule.table == schedule.table)
        {
            return Err(ScheduleError::DuplicateTable {
                table: schedule.table,
            });
        }
        self.entries.push(Entry { schedule, manager });
        Ok(())
    }

    /// Registered schedules, in registration order.
    pub fn tables(&self) -> impl Iterator<Item = &TableSchedule> {
        self.entries.iter().map(|entry| &entry.schedule)
    }

    /// Run every enabled table until `shutdown` is cancelled.
    ///
    /// In-flight runs are cancelled through child tokens and stop at their
    /// next page boundary; this future resolves once all of them have
    /// returned. Disabled tables are never run and report no activity.
    pub async fn run(self, shutdown: CancellationToken) -> Vec<TableActivity> {
        let mut tasks = JoinSet::new();
        for Entry { schedule, manager } in self.entries {
            if !schedule.enabled {
                info!("{} is disabled; not scheduling it", schedule.table);
                continue;
            }
            info!(
                "scheduling {} {} syncs every {:?}",
                schedule.mode,
                schedule.table,
                schedule.interval()
            );
            tasks.spawn(drive_table(schedule, manager, shutdown.child_token()));
        }

        let mut activity = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(table) => activity.push(table),
                Err(err) => error!("scheduler task ended abnormally: {err}"),
            }
        }
        activity.sort_by(|left, right| left.table.cmp(&right.table));
        info!("scheduler stopped");
        activity
    }
}

async fn drive_table(
    schedule: TableSchedule,
    manager: Arc<dyn TableSync>,
    cancel: CancellationToken,
) -> TableActivity {
    let mut activity = TableActivity::new(&schedule.table);
    let mut ticker = tokio::time::interval(schedule.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let run = {
            let manager = Arc::clone(&manager);
            let cancel = cancel.clone();
            let mode = schedule.mode;
            tokio::task::spawn_blocking(move || manager.try_run_sync(mode, &cancel))
        };
        match run.await {
            Ok(Ok(result)) => {
                debug!(
                    "{}: scheduled run ended {} after {} rows",
                    schedule.table, result.final_status, result.rows_written
                );
                activity.record(&result);
            }
            Ok(Err(SyncError::AlreadyRunning { .. })) => {
                info!("{} is already syncing; skipping this tick", schedule.table);
                activity.overlaps_skipped += 1;
            }
            Ok(Err(err)) => {
                warn!("{}: scheduled run could not start: {err}", schedule.table);
                activity.unsuccessful_runs += 1;
            }
            Err(err) => {
                error!("{}: scheduled run panicked: {err}", schedule.table);
                activity.unsuccessful_runs += 1;
            }
        }
    }

    activity
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubsync_core::test_support::{MemoryStore, StubBlobStorage, StubCoreClient};
    use hubsync_core::{CloudBlobAdapter, CoreEntity, CoreEntityAdapter, SyncManager};
    use rstest::rstest;

    fn transactions() -> Arc<dyn TableSync> {
        let store = Arc::new(MemoryStore::default());
        Arc::new(SyncManager::new(
            CoreEntityAdapter::new(StubCoreClient::default(), CoreEntity::Transaction),
            Arc::clone(&store),
            store,
        ))
    }

    fn blobs() -> Arc<dyn TableSync> {
        let store = Arc::new(MemoryStore::default());
        Arc::new(SyncManager::new(
            CloudBlobAdapter::new(StubBlobStorage::with_blob_names("exports", ["a.csv"])),
            Arc::clone(&store),
            store,
        ))
    }

    #[rstest]
    fn registers_tables_in_order() {
        let mut scheduler = Scheduler::new();
        scheduler
            .register(TableSchedule::every("cloudblob", 60), blobs())
            .expect("register blobs");
        scheduler
            .register(TableSchedule::every("hubtransaction", 30).disabled(), transactions())
            .expect("register transactions");

        let tables: Vec<&str> = scheduler.tables().map(|s| s.table.as_str()).collect();
        assert_eq!(tables, ["cloudblob", "hubtransaction"]);
    }

    #[rstest]
    fn rejects_mismatched_managers() {
        let mut scheduler = Scheduler::new();
        let err = scheduler
            .register(TableSchedule::every("hubcheckout", 60), transactions())
            .expect_err("mismatch");
        assert!(matches!(
            err,
            ScheduleError::TableMismatch { schedule, manager }
                if schedule == "hubcheckout" && manager == "hubtransaction"
        ));
    }

    #[rstest]
    fn rejects_duplicate_registrations() {
        let mut scheduler = Scheduler::new();
        scheduler
            .register(TableSchedule::every("hubtransaction", 60), transactions())
            .expect("first registration");
        let err = scheduler
            .register(TableSchedule::every("hubtransaction", 5), transactions())
            .expect_err("duplicate");
        assert!(matches!(err, ScheduleError::DuplicateTable { .. }));
        assert_eq!(scheduler.tables().count(), 1);
    }

    #[tokio::test]
    async fn stops_immediately_when_already_shut_down() {
        let mut scheduler = Scheduler::new();
        scheduler
            .register(TableSchedule::every("hubtransaction", 60), transactions())
            .expect("register");
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let activity = scheduler.run(shutdown).await;

        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].runs, 0);
        assert_eq!(activity[0].last_status, None);
    }
}
