//! In-memory doubles for exercising sync managers without I/O.
//!
//! Available to this crate's tests and, through the `test-support` feature,
//! to downstream crates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;

use crate::checkpoint::{lease_excludes, unix_now};
use crate::{
    BlobEntry, BlobListing, BlobProperties, BlobStorage, CheckpointStore, CheckpointStoreError,
    CoreClient, CoreEntity, Cursor, LocalRow, LocalStore, LocalStoreError, Page, RemoteError,
    Scalar, SourceRecord, SyncCheckpoint, TableSpec,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build a Core transaction record.
#[must_use]
pub fn transaction_record(id: i64, updated_at: i64) -> SourceRecord {
    SourceRecord::from_value(json!({
        "id": id,
        "hub_id": "hub-1",
        "checkout_id": id + 10_000,
        "amount": id * 100,
        "currency": "EUR",
        "status": "settled",
        "payment_method": "card",
        "created_at": updated_at,
        "updated_at": updated_at,
    }))
    .unwrap_or_default()
}

/// Build `count` transactions with ids `1..=count` and strictly increasing
/// markers.
#[must_use]
pub fn transaction_records(count: usize) -> Vec<SourceRecord> {
    (1_i64..)
        .take(count)
        .map(|id| transaction_record(id, 1_700_000_000 + id))
        .collect()
}

/// Budget of successful calls before an injected failure kicks in.
#[derive(Debug, Default)]
struct FailureBudget {
    remaining: Option<usize>,
}

impl FailureBudget {
    /// Consume one call, returning `true` when it must fail.
    fn spend(&mut self) -> bool {
        match self.remaining.as_mut() {
            None => false,
            Some(0) => true,
            Some(remaining) => {
                *remaining -= 1;
                false
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, BTreeMap<Scalar, LocalRow>>,
    checkpoints: BTreeMap<String, SyncCheckpoint>,
    leases: BTreeMap<String, (String, i64)>,
    upserts: FailureBudget,
    checkpoint_writes: FailureBudget,
    upsert_calls: usize,
}

/// Local store and checkpoint store held in memory.
///
/// Failures can be injected after a number of successful writes to simulate
/// a store that breaks mid-run. A failing upsert writes nothing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Let `successes` more upserts through, then fail every following one.
    pub fn fail_upserts_after(&self, successes: usize) {
        lock(&self.state).upserts.remaining = Some(successes);
    }

    /// Let `successes` more checkpoint writes through, then fail the rest.
    pub fn fail_checkpoint_writes_after(&self, successes: usize) {
        lock(&self.state).checkpoint_writes.remaining = Some(successes);
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        let mut state = lock(&self.state);
        state.upserts.remaining = None;
        state.checkpoint_writes.remaining = None;
    }

    /// Rows currently held for `table`.
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        lock(&self.state).tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Primary keys currently held for `table`, in key order.
    #[must_use]
    pub fn keys(&self, table: &str) -> Vec<Scalar> {
        lock(&self.state)
            .tables
            .get(table)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Stored row for `key`, if any.
    #[must_use]
    pub fn row(&self, table: &str, key: &Scalar) -> Option<LocalRow> {
        lock(&self.state)
            .tables
            .get(table)
            .and_then(|rows| rows.get(key).cloned())
    }

    /// Owner currently holding the run lease of `table`, if any.
    #[must_use]
    pub fn lease_holder(&self, table: &str) -> Option<String> {
        lock(&self.state)
            .leases
            .get(table)
            .map(|(owner, _)| owner.clone())
    }

    /// Record a lease on `table` for `owner` as if taken at `acquired_at`.
    pub fn plant_lease(&self, table: &str, owner: &str, acquired_at: i64) {
        lock(&self.state)
            .leases
            .insert(table.to_owned(), (owner.to_owned(), acquired_at));
    }

    /// Number of upsert calls received, including failed ones.
    #[must_use]
    pub fn upsert_calls(&self) -> usize {
        lock(&self.state).upsert_calls
    }
}

impl LocalStore for MemoryStore {
    fn ensure_table(&self, table: &TableSpec) -> Result<(), LocalStoreError> {
        lock(&self.state)
            .tables
            .entry(table.name().to_owned())
            .or_default();
        Ok(())
    }

    fn upsert_batch(&self, table: &TableSpec, rows: &[LocalRow]) -> Result<(), LocalStoreError> {
        let mut state = lock(&self.state);
        state.upsert_calls += 1;
        if state.upserts.spend() {
            return Err(LocalStoreError::Unavailable {
                message: format!("injected upsert failure for {}", table.name()),
            });
        }
        let Some(stored) = state.tables.get_mut(table.name()) else {
            return Err(LocalStoreError::Unavailable {
                message: format!("table {} does not exist", table.name()),
            });
        };
        for row in rows {
            stored.insert(row.key.clone(), row.clone());
        }
        Ok(())
    }

    fn clear_table(&self, table_name: &str) -> Result<(), LocalStoreError> {
        if let Some(rows) = lock(&self.state).tables.get_mut(table_name) {
            rows.clear();
        }
        Ok(())
    }

    fn count(&self, table_name: &str) -> Result<u64, LocalStoreError> {
        Ok(u64::try_from(self.row_count(table_name)).unwrap_or(u64::MAX))
    }

    fn table_exists(&self, table_name: &str) -> Result<bool, LocalStoreError> {
        Ok(lock(&self.state).tables.contains_key(table_name))
    }
}

impl CheckpointStore for MemoryStore {
    fn get(&self, table_name: &str) -> Result<Option<SyncCheckpoint>, CheckpointStoreError> {
        Ok(lock(&self.state).checkpoints.get(table_name).cloned())
    }

    fn put(&self, checkpoint: &SyncCheckpoint) -> Result<(), CheckpointStoreError> {
        let mut state = lock(&self.state);
        if state.checkpoint_writes.spend() {
            return Err(CheckpointStoreError::Unavailable {
                message: format!("injected checkpoint failure for {}", checkpoint.table_name),
            });
        }
        state
            .checkpoints
            .insert(checkpoint.table_name.clone(), checkpoint.clone());
        Ok(())
    }

    fn acquire_lease(
        &self,
        table_name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, CheckpointStoreError> {
        let now = unix_now();
        let mut state = lock(&self.state);
        if let Some((holder, acquired_at)) = state.leases.get(table_name)
            && lease_excludes(holder, *acquired_at, owner, now, ttl)
        {
            return Ok(false);
        }
        state
            .leases
            .insert(table_name.to_owned(), (owner.to_owned(), now));
        Ok(true)
    }

    fn release_lease(&self, table_name: &str, owner: &str) -> Result<(), CheckpointStoreError> {
        let mut state = lock(&self.state);
        if state
            .leases
            .get(table_name)
            .is_some_and(|(holder, _)| holder == owner)
        {
            state.leases.remove(table_name);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ClientState {
    records: BTreeMap<CoreEntity, Vec<SourceRecord>>,
    scripted_failures: BTreeMap<usize, RemoteError>,
    count_failure: Option<RemoteError>,
    requests: Vec<(CoreEntity, Cursor)>,
    held: bool,
    waiting: usize,
}

/// Scriptable [`CoreClient`] serving records from memory with keyset paging.
///
/// Records are served in the order given, which should follow
/// `(updated_at, id)`. Malformed records are served in place so the sync
/// manager's skipping logic can be exercised.
#[derive(Debug, Default)]
pub struct StubCoreClient {
    state: Mutex<ClientState>,
    gate: Condvar,
}

impl StubCoreClient {
    /// Replace the records served for `entity`.
    pub fn set_records(&self, entity: CoreEntity, records: Vec<SourceRecord>) {
        lock(&self.state).records.insert(entity, records);
    }

    /// Append records served for `entity`.
    pub fn push_records(&self, entity: CoreEntity, records: Vec<SourceRecord>) {
        lock(&self.state)
            .records
            .entry(entity)
            .or_default()
            .extend(records);
    }

    /// Fail the fetch with the given 1-based call number.
    pub fn fail_fetch_call(&self, call: usize, error: RemoteError) {
        lock(&self.state).scripted_failures.insert(call, error);
    }

    /// Fail the next `times` fetches with `error`.
    pub fn fail_next_fetches(&self, times: usize, error: &RemoteError) {
        let mut state = lock(&self.state);
        let issued = state.requests.len();
        for call in issued + 1..=issued + times {
            state.scripted_failures.insert(call, error.clone());
        }
    }

    /// Make every count request fail with `error`.
    pub fn fail_counts(&self, error: RemoteError) {
        lock(&self.state).count_failure = Some(error);
    }

    /// Cursors requested so far, in call order.
    #[must_use]
    pub fn requests(&self) -> Vec<(CoreEntity, Cursor)> {
        lock(&self.state).requests.clone()
    }

    /// Block subsequent fetches until [`Self::release_fetches`] is called.
    pub fn hold_fetches(&self) {
        lock(&self.state).held = true;
    }

    /// Unblock held fetches.
    pub fn release_fetches(&self) {
        lock(&self.state).held = false;
        self.gate.notify_all();
    }

    /// Wait until at least one fetch is blocked by [`Self::hold_fetches`].
    pub fn wait_for_held_fetch(&self) {
        let state = lock(&self.state);
        let _state = self
            .gate
            .wait_while(state, |state| state.waiting == 0)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

impl CoreClient for StubCoreClient {
    fn count(&self, entity: CoreEntity) -> Result<u64, RemoteError> {
        let state = lock(&self.state);
        if let Some(error) = &state.count_failure {
            return Err(error.clone());
        }
        let served = state.records.get(&entity).map_or(0, Vec::len);
        Ok(u64::try_from(served).unwrap_or(u64::MAX))
    }

    fn fetch_page(
        &self,
        entity: CoreEntity,
        cursor: &Cursor,
        page_size: usize,
    ) -> Result<Page, RemoteError> {
        let mut state = lock(&self.state);
        if state.held {
            state.waiting += 1;
            self.gate.notify_all();
            state = self
                .gate
                .wait_while(state, |state| state.held)
                .unwrap_or_else(PoisonError::into_inner);
            state.waiting -= 1;
        }

        state.requests.push((entity, cursor.clone()));
        let call = state.requests.len();
        if let Some(error) = state.scripted_failures.remove(&call) {
            return Err(error);
        }

        let table = entity.table_spec();
        let records = state.records.get(&entity).map_or(&[][..], Vec::as_slice);
        let start = match cursor {
            Cursor::Start => 0,
            Cursor::Watermark { marker, key } => records
                .iter()
                .position(|record| {
                    matches!(
                        table.position_of(record),
                        Ok(Some((record_marker, record_key)))
                            if (&record_marker, &record_key) > (marker, key)
                    )
                })
                .unwrap_or(records.len()),
            Cursor::Token { .. } => {
                return Err(RemoteError::Misconfigured {
                    message: "core entities are paged by watermark".to_owned(),
                });
            }
        };
        let end = start.saturating_add(page_size).min(records.len());
        let page = Page::new(records.get(start..end).unwrap_or_default().to_vec());
        Ok(if end >= records.len() && end > start {
            page.into_last()
        } else {
            page
        })
    }
}

#[derive(Debug, Default)]
struct BlobState {
    entries: Vec<BlobEntry>,
    properties: BTreeMap<String, BlobProperties>,
    property_requests: usize,
    list_failures: Vec<RemoteError>,
}

/// Blob container held in memory, paged with numeric continuation tokens.
#[derive(Debug, Default)]
pub struct StubBlobStorage {
    container: String,
    state: Mutex<BlobState>,
}

impl StubBlobStorage {
    /// Container `container` holding blobs called `names`, each with
    /// properties available.
    #[must_use]
    pub fn with_blob_names<I, S>(container: impl Into<String>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let storage = Self {
            container: container.into(),
            state: Mutex::default(),
        };
        for name in names {
            storage.add_blob(name);
        }
        storage
    }

    /// Add a blob with default listing data and properties.
    pub fn add_blob(&self, name: impl Into<String>) {
        let name = name.into();
        let mut state = lock(&self.state);
        state.properties.insert(
            name.clone(),
            BlobProperties {
                size: 1_024,
                last_modified: "2024-05-01T12:00:00Z".to_owned(),
                content_type: Some("text/csv".to_owned()),
                content_md5: Some(format!("md5-{name}")),
                etag: Some(format!("\"etag-{name}\"")),
            },
        );
        state.entries.push(BlobEntry {
            name,
            size: Some(1_024),
            content_type: None,
            last_modified: Some("2024-05-01T12:00:00Z".to_owned()),
            etag: None,
        });
        state.entries.sort_by(|left, right| left.name.cmp(&right.name));
    }

    /// Make the properties of `name` unavailable, as if it were deleted
    /// after being listed.
    pub fn remove_properties(&self, name: &str) {
        lock(&self.state).properties.remove(name);
    }

    /// Fail the next listing call with `error`.
    pub fn fail_next_listing(&self, error: RemoteError) {
        lock(&self.state).list_failures.push(error);
    }

    /// Number of property requests served.
    #[must_use]
    pub fn property_requests(&self) -> usize {
        lock(&self.state).property_requests
    }

    /// Names of the listed blobs.
    #[must_use]
    pub fn names(&self) -> BTreeSet<String> {
        lock(&self.state)
            .entries
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }
}

impl BlobStorage for StubBlobStorage {
    fn container(&self) -> &str {
        &self.container
    }

    fn list_blobs(&self, token: Option<&str>, page_size: usize) -> Result<BlobListing, RemoteError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.list_failures.pop() {
            return Err(error);
        }
        let start = match token {
            None => 0,
            Some(token) => token.parse::<usize>().map_err(|_| RemoteError::Malformed {
                operation: "list blobs".to_owned(),
                message: format!("unknown continuation token {token}"),
            })?,
        };
        let end = start.saturating_add(page_size.max(1)).min(state.entries.len());
        let entries = state.entries.get(start..end).unwrap_or_default().to_vec();
        let next_token = (end < state.entries.len()).then(|| end.to_string());
        Ok(BlobListing {
            entries,
            next_token,
        })
    }

    fn fetch_blob_properties(&self, name: &str) -> Result<BlobProperties, RemoteError> {
        let mut state = lock(&self.state);
        state.property_requests += 1;
        state
            .properties
            .get(name)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound {
                operation: format!("blob properties for {name}"),
            })
    }

    fn count_blobs(&self) -> Result<u64, RemoteError> {
        Ok(u64::try_from(lock(&self.state).entries.len()).unwrap_or(u64::MAX))
    }
}
