//! The sync manager: fetch, normalize, write, checkpoint.
//!
//! A [`SyncManager`] owns one [`EntityAdapter`] and drives it page by page
//! into a [`LocalStore`], persisting a [`SyncCheckpoint`] after every page it
//! commits. The checkpoint therefore never runs ahead of the data: a run
//! interrupted at any point resumes from the last page that was fully
//! written, and because writes are upserts, replaying that page is harmless.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::unix_now;
use crate::reconcile::{ReconcileError, Reconciliation, reconcile};
use crate::{
    CheckpointStore, CheckpointStoreError, Cursor, EntityAdapter, LocalStore, Page, RunStatus,
    SyncCheckpoint,
};

mod error;
mod retry;

pub use error::SyncError;
pub use retry::RetryPolicy;

#[cfg(test)]
mod tests;

/// Page size used when none is configured.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Time after which an unrenewed run lease may be taken over.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15 * 60);

/// Pause between attempts to claim a lease held by another run.
const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(250);

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// How a run treats existing local data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Continue from the stored checkpoint.
    #[default]
    Incremental,
    /// Reset the checkpoint, clear the table and fetch everything again.
    FromScratch,
}

impl SyncMode {
    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::FromScratch => "from_scratch",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a sync mode label is unknown.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown sync mode `{0}`; expected `incremental` or `from_scratch`")]
pub struct UnknownSyncMode(pub String);

impl FromStr for SyncMode {
    type Err = UnknownSyncMode;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        match label.to_ascii_lowercase().replace('-', "_").as_str() {
            "incremental" => Ok(Self::Incremental),
            "from_scratch" | "full" => Ok(Self::FromScratch),
            _ => Err(UnknownSyncMode(label.to_owned())),
        }
    }
}

/// Tunables for a [`SyncManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Records requested per page.
    pub page_size: usize,
    /// Stop cleanly after this many pages; the next run continues.
    pub max_pages: Option<usize>,
    /// Stop fetching once a run has taken this long.
    pub timeout: Option<Duration>,
    /// Backoff applied to transient remote failures.
    pub retry: RetryPolicy,
    /// How long a run lease stays valid without renewal. Leases are renewed
    /// with every committed page.
    pub lease_ttl: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: None,
            timeout: None,
            retry: RetryPolicy::default(),
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

impl SyncOptions {
    /// Set the page size; zero is treated as one.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Bound the number of pages fetched per run.
    #[must_use]
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    /// Bound the wall-clock duration of a run.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the run lease time to live.
    #[must_use]
    pub const fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }
}

/// Summary of one sync run. Not persisted.
#[derive(Debug)]
pub struct SyncRunResult {
    /// Table that was synced.
    pub table_name: String,
    /// Mode the run used.
    pub mode: SyncMode,
    /// Pages fetched from the source, including a final empty page.
    pub pages_fetched: u64,
    /// Rows upserted into the local table.
    pub rows_written: u64,
    /// Records skipped because they could not be normalized.
    pub skipped_records: u64,
    /// Outcome recorded on the checkpoint.
    pub final_status: RunStatus,
    /// Last committed cursor.
    pub cursor: Cursor,
    /// Why the run did not finish cleanly, if it did not.
    pub error: Option<SyncError>,
}

impl SyncRunResult {
    /// Return `true` when the run finished with [`RunStatus::Success`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.final_status == RunStatus::Success
    }
}

/// Object-safe view of a sync manager, used by schedulers and front ends
/// that drive several tables at once.
pub trait TableSync: Send + Sync {
    /// Table the manager syncs.
    fn table_name(&self) -> &str;

    /// Run a sync, waiting for any run already in progress to finish first.
    fn run_sync(&self, mode: SyncMode, cancel: &CancellationToken) -> SyncRunResult;

    /// Run a sync unless one is already in progress.
    ///
    /// # Errors
    /// Returns [`SyncError::AlreadyRunning`] when another run of the table is
    /// in progress.
    fn try_run_sync(
        &self,
        mode: SyncMode,
        cancel: &CancellationToken,
    ) -> Result<SyncRunResult, SyncError>;

    /// Current checkpoint, or a never-run checkpoint when none is stored.
    ///
    /// # Errors
    /// Returns [`CheckpointStoreError`] when the store cannot be read.
    fn checkpoint_status(&self) -> Result<SyncCheckpoint, CheckpointStoreError>;

    /// Compare local and remote row counts.
    ///
    /// # Errors
    /// Returns [`ReconcileError`] when either count cannot be obtained.
    fn probe(&self) -> Result<Reconciliation, ReconcileError>;
}

/// Generic sync manager for one table.
///
/// Only one run per table executes at a time. Runs of one manager are
/// serialized in process, and every run holds the table's lease in the
/// checkpoint store, which excludes runs of other managers and processes
/// sharing that store. Managers for different tables are independent.
#[derive(Debug)]
pub struct SyncManager<A, L, C> {
    adapter: A,
    store: L,
    checkpoints: C,
    options: SyncOptions,
    owner: String,
    run_lock: Mutex<()>,
}

/// Run lease on one table, released when dropped.
struct LeaseGuard<'a, C: CheckpointStore> {
    checkpoints: &'a C,
    table: &'a str,
    owner: &'a str,
}

impl<C: CheckpointStore> Drop for LeaseGuard<'_, C> {
    fn drop(&mut self) {
        if let Err(err) = self.checkpoints.release_lease(self.table, self.owner) {
            warn!("failed to release the run lease on {}: {err}", self.table);
        }
    }
}

#[derive(Debug, Default)]
struct RunProgress {
    pages_fetched: u64,
    rows_written: u64,
    skipped_records: u64,
    committed: Option<Cursor>,
}

impl<A, L, C> SyncManager<A, L, C>
where
    A: EntityAdapter,
    L: LocalStore,
    C: CheckpointStore,
{
    /// Build a manager with default options.
    pub fn new(adapter: A, store: L, checkpoints: C) -> Self {
        Self {
            adapter,
            store,
            checkpoints,
            options: SyncOptions::default(),
            owner: format!(
                "{}-{}",
                std::process::id(),
                NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
            ),
            run_lock: Mutex::new(()),
        }
    }

    /// Replace the manager's options.
    #[must_use]
    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// Options in effect.
    pub const fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Adapter driving this manager.
    pub const fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Local store receiving rows.
    pub const fn store(&self) -> &L {
        &self.store
    }

    /// Name of the synced table.
    pub fn table_name(&self) -> &str {
        self.adapter.table().name()
    }

    /// Identity under which this manager holds run leases.
    pub fn lease_owner(&self) -> &str {
        &self.owner
    }

    /// Run one sync to completion, waiting for any other run of the table to
    /// finish first.
    pub fn sync_once(&self, mode: SyncMode) -> SyncRunResult {
        self.sync_once_with(mode, &CancellationToken::new())
    }

    /// Run one sync, stopping between pages once `cancel` fires.
    ///
    /// Waits for the table's lease when another run holds it. Cancelling
    /// while waiting, or failing to reach the lease, ends the call without
    /// touching the checkpoint.
    pub fn sync_once_with(&self, mode: SyncMode, cancel: &CancellationToken) -> SyncRunResult {
        let _guard = self
            .run_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _lease = match self.wait_for_lease(cancel) {
            Ok(lease) => lease,
            Err(err) => return self.unstarted(mode, err),
        };
        self.run(mode, cancel)
    }

    /// Run one sync unless another run of the table is in progress.
    ///
    /// # Errors
    /// Returns [`SyncError::AlreadyRunning`] without touching any state when
    /// this manager is busy or another manager holds the table's lease, and
    /// [`SyncError::Checkpoint`] when the lease cannot be read.
    pub fn try_sync_once(
        &self,
        mode: SyncMode,
        cancel: &CancellationToken,
    ) -> Result<SyncRunResult, SyncError> {
        let _guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(self.already_running());
            }
        };
        let Some(_lease) = self.claim_lease()? else {
            return Err(self.already_running());
        };
        Ok(self.run(mode, cancel))
    }

    /// Stored checkpoint for the table, or a never-run checkpoint.
    ///
    /// # Errors
    /// Returns [`CheckpointStoreError`] when the store cannot be read.
    pub fn get_checkpoint_status(&self) -> Result<SyncCheckpoint, CheckpointStoreError> {
        let table = self.table_name();
        Ok(self
            .checkpoints
            .get(table)?
            .unwrap_or_else(|| SyncCheckpoint::never_run(table)))
    }

    /// Compare the local row count with the source's authoritative count.
    ///
    /// # Errors
    /// Returns [`ReconcileError`] when either count cannot be obtained.
    pub fn reconcile(&self) -> Result<Reconciliation, ReconcileError> {
        reconcile(&self.adapter, &self.store)
    }

    fn already_running(&self) -> SyncError {
        SyncError::AlreadyRunning {
            table: self.table_name().to_owned(),
        }
    }

    fn claim_lease(&self) -> Result<Option<LeaseGuard<'_, C>>, CheckpointStoreError> {
        let table = self.table_name();
        let claimed = self
            .checkpoints
            .acquire_lease(table, &self.owner, self.options.lease_ttl)?;
        Ok(claimed.then_some(LeaseGuard {
            checkpoints: &self.checkpoints,
            table,
            owner: &self.owner,
        }))
    }

    fn wait_for_lease(&self, cancel: &CancellationToken) -> Result<LeaseGuard<'_, C>, SyncError> {
        let mut announced = false;
        loop {
            if let Some(lease) = self.claim_lease()? {
                return Ok(lease);
            }
            if !announced {
                info!("waiting for another sync of {} to finish", self.table_name());
                announced = true;
            }
            if !retry::pause(cancel, LEASE_POLL_INTERVAL) {
                return Err(SyncError::Cancelled);
            }
        }
    }

    /// Result of a call that never started a run. The checkpoint belongs to
    /// whichever run holds the lease, so it is reported but not written.
    fn unstarted(&self, mode: SyncMode, error: SyncError) -> SyncRunResult {
        let table = self.table_name().to_owned();
        warn!("{mode} sync of {table} did not start: {error}");
        let cursor = self
            .checkpoints
            .get(&table)
            .ok()
            .flatten()
            .map(|checkpoint| checkpoint.cursor)
            .unwrap_or_default();
        SyncRunResult {
            table_name: table,
            mode,
            pages_fetched: 0,
            rows_written: 0,
            skipped_records: 0,
            final_status: error.status(),
            cursor,
            error: Some(error),
        }
    }

    fn run(&self, mode: SyncMode, cancel: &CancellationToken) -> SyncRunResult {
        let table = self.table_name().to_owned();
        info!("starting {mode} sync of {table}");
        let started_at = unix_now();
        let mut progress = RunProgress::default();

        let outcome = self.execute(mode, cancel, &mut progress);
        let mut error = match outcome {
            Err(err) => Some(err),
            Ok(()) if progress.skipped_records > 0 => Some(SyncError::SkippedRecords {
                skipped: progress.skipped_records,
            }),
            Ok(()) => None,
        };
        let mut status = error.as_ref().map_or(RunStatus::Success, SyncError::status);

        let lease_lost = matches!(error, Some(SyncError::LeaseLost { .. }));
        if !lease_lost
            && let Err(err) = self.record_outcome(&table, status, started_at, &progress)
        {
            warn!("failed to record the outcome of the {table} sync: {err}");
            status = RunStatus::Failed;
            error = error.or(Some(SyncError::Checkpoint(err)));
        }

        match &error {
            Some(err) => warn!("{mode} sync of {table} ended {status}: {err}"),
            None => info!(
                "{mode} sync of {table} succeeded: {} pages, {} rows",
                progress.pages_fetched, progress.rows_written
            ),
        }

        SyncRunResult {
            table_name: table,
            mode,
            pages_fetched: progress.pages_fetched,
            rows_written: progress.rows_written,
            skipped_records: progress.skipped_records,
            final_status: status,
            cursor: progress.committed.unwrap_or_default(),
            error,
        }
    }

    fn execute(
        &self,
        mode: SyncMode,
        cancel: &CancellationToken,
        progress: &mut RunProgress,
    ) -> Result<(), SyncError> {
        let started = Instant::now();
        let table = self.adapter.table();
        let name = table.name();

        let mut cursor = match mode {
            SyncMode::FromScratch => {
                self.checkpoints.reset(name)?;
                progress.committed = Some(Cursor::Start);
                self.store.clear_table(name)?;
                Cursor::Start
            }
            SyncMode::Incremental => {
                let stored = self
                    .checkpoints
                    .get(name)?
                    .map(|checkpoint| checkpoint.cursor)
                    .unwrap_or_default();
                progress.committed = Some(stored.clone());
                stored
            }
        };
        self.store.ensure_table(table)?;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if let Some(timeout) = self.options.timeout
                && started.elapsed() >= timeout
            {
                return Err(SyncError::TimedOut { timeout });
            }
            if let Some(max_pages) = self.options.max_pages
                && progress.pages_fetched >= u64::try_from(max_pages).unwrap_or(u64::MAX)
            {
                debug!("{name}: page limit of {max_pages} reached");
                return Ok(());
            }

            let page = retry::call_with_retry(&self.options.retry, cancel, name, || {
                self.adapter.fetch_page(&cursor, self.options.page_size)
            })?;
            progress.pages_fetched += 1;

            if page.is_empty() {
                if let Some(next) = page.next_cursor
                    && next != cursor
                {
                    self.commit(name, &next, progress)?;
                }
                return Ok(());
            }

            let next = self.write_page(&cursor, &page, progress)?;
            if next == cursor {
                if page.is_last {
                    return Ok(());
                }
                return Err(SyncError::CursorStalled {
                    cursor,
                    first_record: page
                        .records
                        .first()
                        .and_then(|record| serde_json::to_string(record).ok()),
                });
            }
            self.commit(name, &next, progress)?;
            cursor = next;

            if page.is_last {
                return Ok(());
            }
        }
    }

    /// Normalize and upsert one page, returning the cursor that follows it.
    fn write_page(
        &self,
        cursor: &Cursor,
        page: &Page,
        progress: &mut RunProgress,
    ) -> Result<Cursor, SyncError> {
        let table = self.adapter.table();
        let synced_at = unix_now();
        let mut rows = Vec::with_capacity(page.records.len());
        let mut positions = Vec::with_capacity(page.records.len());

        for record in &page.records {
            if let Ok(Some(position)) = self.adapter.position(record) {
                positions.push(position);
            }
            match self.adapter.normalize(record, synced_at) {
                Ok(row) => rows.push(row),
                Err(err) => {
                    progress.skipped_records += 1;
                    warn!("skipping malformed {} record: {err}", table.name());
                }
            }
        }

        self.store.upsert_batch(table, &rows)?;
        progress.rows_written += u64::try_from(rows.len()).unwrap_or(u64::MAX);

        let candidate = page
            .next_cursor
            .clone()
            .or_else(|| Cursor::highest_watermark(positions));
        Ok(candidate.map_or_else(|| cursor.clone(), |next| cursor.advance(next)))
    }

    /// Persist `cursor` as the table's committed position.
    fn commit(
        &self,
        table: &str,
        cursor: &Cursor,
        progress: &mut RunProgress,
    ) -> Result<(), SyncError> {
        if !self
            .checkpoints
            .acquire_lease(table, &self.owner, self.options.lease_ttl)?
        {
            return Err(SyncError::LeaseLost {
                table: table.to_owned(),
            });
        }
        let checkpoint = SyncCheckpoint {
            table_name: table.to_owned(),
            cursor: cursor.clone(),
            last_run_status: RunStatus::Partial,
            last_run_at: Some(unix_now()),
            rows_written_last_run: progress.rows_written,
        };
        self.checkpoints.put(&checkpoint)?;
        debug!("{table}: committed cursor {cursor:?}");
        progress.committed = Some(checkpoint.cursor);
        Ok(())
    }

    /// Record the run's final status, keeping the last committed cursor.
    fn record_outcome(
        &self,
        table: &str,
        status: RunStatus,
        started_at: i64,
        progress: &RunProgress,
    ) -> Result<(), CheckpointStoreError> {
        let mut checkpoint = self
            .checkpoints
            .get(table)?
            .unwrap_or_else(|| SyncCheckpoint::never_run(table));
        if let Some(cursor) = &progress.committed {
            checkpoint.cursor = cursor.clone();
        }
        checkpoint.last_run_status = status;
        checkpoint.last_run_at = Some(started_at);
        checkpoint.rows_written_last_run = progress.rows_written;
        self.checkpoints.put(&checkpoint)
    }
}

impl<A, L, C> TableSync for SyncManager<A, L, C>
where
    A: EntityAdapter,
    L: LocalStore,
    C: CheckpointStore,
{
    fn table_name(&self) -> &str {
        self.adapter.table().name()
    }

    fn run_sync(&self, mode: SyncMode, cancel: &CancellationToken) -> SyncRunResult {
        self.sync_once_with(mode, cancel)
    }

    fn try_run_sync(
        &self,
        mode: SyncMode,
        cancel: &CancellationToken,
    ) -> Result<SyncRunResult, SyncError> {
        self.try_sync_once(mode, cancel)
    }

    fn checkpoint_status(&self) -> Result<SyncCheckpoint, CheckpointStoreError> {
        self.get_checkpoint_status()
    }

    fn probe(&self) -> Result<Reconciliation, ReconcileError> {
        self.reconcile()
    }
}

