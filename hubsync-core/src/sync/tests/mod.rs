//! Unit tests for the sync manager.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rstest::{fixture, rstest};
use serde_json::json;

use super::*;
use crate::test_support::{
    MemoryStore, StubBlobStorage, StubCoreClient, transaction_record, transaction_records,
};
use crate::{
    CloudBlobAdapter, CoreEntity, CoreEntityAdapter, RemoteError, Scalar, SourceRecord, TableSpec,
};

mod behaviour;

type CoreManager =
    SyncManager<CoreEntityAdapter<Arc<StubCoreClient>>, Arc<MemoryStore>, Arc<MemoryStore>>;

const TABLE: &str = "hubtransaction";

struct Harness {
    client: Arc<StubCoreClient>,
    store: Arc<MemoryStore>,
}

impl Harness {
    fn manager(&self, options: SyncOptions) -> CoreManager {
        SyncManager::new(
            CoreEntityAdapter::new(Arc::clone(&self.client), CoreEntity::Transaction),
            Arc::clone(&self.store),
            Arc::clone(&self.store),
        )
        .with_options(options)
    }

    fn checkpoint(&self) -> SyncCheckpoint {
        self.store
            .get(TABLE)
            .expect("read checkpoint")
            .expect("checkpoint stored")
    }
}

#[fixture]
fn harness() -> Harness {
    Harness {
        client: Arc::new(StubCoreClient::default()),
        store: Arc::new(MemoryStore::default()),
    }
}

fn options(page_size: usize) -> SyncOptions {
    SyncOptions::default()
        .with_page_size(page_size)
        .with_retry(RetryPolicy::new(3, Duration::ZERO, Duration::ZERO))
}

fn watermark_of(id: i64) -> Cursor {
    Cursor::watermark(1_700_000_000 + id, id)
}

fn unavailable() -> RemoteError {
    RemoteError::Unavailable {
        operation: "fetch hub-transactions".into(),
        status: 503,
        message: "maintenance".into(),
    }
}

#[rstest]
fn first_run_syncs_everything(harness: Harness) {
    harness
        .client
        .set_records(CoreEntity::Transaction, transaction_records(5));
    let manager = harness.manager(options(2));

    let result = manager.sync_once(SyncMode::Incremental);

    assert!(result.is_success(), "unexpected error: {:?}", result.error);
    assert_eq!(result.pages_fetched, 3);
    assert_eq!(result.rows_written, 5);
    assert_eq!(result.cursor, watermark_of(5));
    assert_eq!(harness.store.row_count(TABLE), 5);

    let checkpoint = harness.checkpoint();
    assert_eq!(checkpoint.cursor, watermark_of(5));
    assert_eq!(checkpoint.last_run_status, RunStatus::Success);
    assert_eq!(checkpoint.rows_written_last_run, 5);
    assert!(checkpoint.last_run_at.is_some());
}

#[rstest]
fn repeated_runs_without_new_data_change_nothing(harness: Harness) {
    harness
        .client
        .set_records(CoreEntity::Transaction, transaction_records(4));
    let manager = harness.manager(options(10));
    manager.sync_once(SyncMode::Incremental);
    let before = harness.checkpoint().cursor;

    let result = manager.sync_once(SyncMode::Incremental);

    assert!(result.is_success());
    assert_eq!(result.rows_written, 0);
    assert_eq!(harness.store.row_count(TABLE), 4);
    assert_eq!(harness.checkpoint().cursor, before);
}

#[rstest]
fn incremental_runs_pick_up_new_records(harness: Harness) {
    harness
        .client
        .set_records(CoreEntity::Transaction, transaction_records(3));
    let manager = harness.manager(options(10));
    manager.sync_once(SyncMode::Incremental);

    harness.client.push_records(
        CoreEntity::Transaction,
        vec![transaction_record(4, 1_700_000_100)],
    );
    let result = manager.sync_once(SyncMode::Incremental);

    assert_eq!(result.rows_written, 1);
    assert_eq!(harness.store.row_count(TABLE), 4);
    assert_eq!(
        harness.checkpoint().cursor,
        Cursor::watermark(1_700_000_100, 4)
    );
}

#[rstest]
fn from_scratch_replaces_stale_rows(harness: Harness) {
    harness
        .client
        .set_records(CoreEntity::Transaction, transaction_records(6));
    let manager = harness.manager(options(4));
    manager.sync_once(SyncMode::Incremental);

    harness
        .client
        .set_records(CoreEntity::Transaction, transaction_records(3));
    let result = manager.sync_once(SyncMode::FromScratch);

    assert!(result.is_success());
    assert_eq!(harness.store.row_count(TABLE), 3);
    let probe = manager.reconcile().expect("reconcile");
    assert_eq!(probe.counts(), (3, 3));
    assert_eq!(
        harness.client.requests().get(2).map(|(_, cursor)| cursor.clone()),
        Some(Cursor::Start)
    );
}

#[rstest]
fn interrupted_runs_resume_from_the_last_committed_page(harness: Harness) {
    harness
        .client
        .set_records(CoreEntity::Transaction, transaction_records(4));
    harness.client.fail_fetch_call(2, unavailable());
    let manager = harness.manager(options(2).with_retry(RetryPolicy::none()));

    let interrupted = manager.sync_once(SyncMode::Incremental);
    assert_eq!(interrupted.final_status, RunStatus::Partial);
    assert!(matches!(
        interrupted.error,
        Some(SyncError::RetriesExhausted { attempts: 1, .. })
    ));
    assert_eq!(harness.checkpoint().cursor, watermark_of(2));
    assert_eq!(harness.checkpoint().last_run_status, RunStatus::Partial);

    let resumed = manager.sync_once(SyncMode::Incremental);
    assert!(resumed.is_success());
    assert_eq!(resumed.rows_written, 2);
    let requests = harness.client.requests();
    assert_eq!(requests.get(2).map(|(_, cursor)| cursor), Some(&watermark_of(2)));
    assert_eq!(
        harness.store.keys(TABLE),
        (1..=4).map(Scalar::Int).collect::<Vec<_>>()
    );
}

#[rstest]
fn transient_failures_are_retried_within_a_run(harness: Harness) {
    harness
        .client
        .set_records(CoreEntity::Transaction, transaction_records(3));
    harness.client.fail_next_fetches(2, &unavailable());
    let manager = harness.manager(options(10));

    let result = manager.sync_once(SyncMode::Incremental);

    assert!(result.is_success());
    assert_eq!(harness.store.row_count(TABLE), 3);
    assert_eq!(harness.client.requests().len(), 3);
}

#[rstest]
fn failed_writes_leave_the_checkpoint_behind(harness: Harness) {
    harness
        .client
        .set_records(CoreEntity::Transaction, transaction_records(4));
    harness.store.fail_upserts_after(1);
    let manager = harness.manager(options(2));

    let failed = manager.sync_once(SyncMode::Incremental);
    assert_eq!(failed.final_status, RunStatus::Failed);
    assert!(matches!(failed.error, Some(SyncError::LocalWrite(_))));
    assert_eq!(harness.checkpoint().cursor, watermark_of(2));
    assert_eq!(harness.checkpoint().last_run_status, RunStatus::Failed);
    assert_eq!(harness.store.row_count(TABLE), 2);

    harness.store.heal();
    let rerun = manager.sync_once(SyncMode::Incremental);
    assert!(rerun.is_success());
    assert_eq!(harness.store.row_count(TABLE), 4);
}

#[rstest]
fn failed_checkpoint_writes_fail_the_run(harness: Harness) {
    harness
        .client
        .set_records(CoreEntity::Transaction, transaction_records(4));
    harness.store.fail_checkpoint_writes_after(1);
    let manager = harness.manager(options(2));

    let result = manager.sync_once(SyncMode::Incremental);

    assert_eq!(result.final_status, RunStatus::Failed);
    assert!(matches!(result.error, Some(SyncError::Checkpoint(_))));
    assert_eq!(result.cursor, watermark_of(2));
    assert_eq!(harness.checkpoint().cursor, watermark_of(2));
}

#[rstest]
fn malformed_records_are_skipped_and_counted(harness: Harness) {
    let mut records = transaction_records(2);
    records.push(
        SourceRecord::from_value(json!({"amount": 5, "updated_at": 1_700_000_003}))
            .expect("object record"),
    );
    records.push(transaction_record(4, 1_700_000_004));
    harness.client.set_records(CoreEntity::Transaction, records);
    let manager = harness.manager(options(10));

    let result = manager.sync_once(SyncMode::Incremental);

    assert_eq!(result.final_status, RunStatus::Partial);
    assert_eq!(result.skipped_records, 1);
    assert!(matches!(
        result.error,
        Some(SyncError::SkippedRecords { skipped: 1 })
    ));
    assert_eq!(harness.store.row_count(TABLE), 3);
    assert_eq!(harness.checkpoint().cursor, watermark_of(4));
}

#[rstest]
fn records_sharing_a_marker_across_pages_are_all_synced(harness: Harness) {
    let records = (1..=5)
        .map(|id| transaction_record(id, 1_700_000_500))
        .collect();
    harness.client.set_records(CoreEntity::Transaction, records);
    let manager = harness.manager(options(2).with_max_pages(1));

    for _ in 0..3 {
        manager.sync_once(SyncMode::Incremental);
    }

    assert_eq!(harness.store.row_count(TABLE), 5);
    assert_eq!(
        harness.checkpoint().cursor,
        Cursor::watermark(1_700_000_500, 5)
    );
}

#[rstest]
fn page_limits_spread_a_backlog_over_several_runs(harness: Harness) {
    harness
        .client
        .set_records(CoreEntity::Transaction, transaction_records(250));
    let manager = harness.manager(options(100).with_max_pages(1));

    let rows: Vec<u64> = (0..3)
        .map(|_| manager.sync_once(SyncMode::Incremental).rows_written)
        .collect();

    assert_eq!(rows, [100, 100, 50]);
    assert_eq!(harness.store.row_count(TABLE), 250);
    let checkpoint = manager.get_checkpoint_status().expect("checkpoint");
    assert_eq!(checkpoint.cursor, watermark_of(250));
    assert_eq!(checkpoint.last_run_status, RunStatus::Success);
}

#[rstest]
fn rejected_requests_fail_without_retrying(harness: Harness) {
    harness
        .client
        .set_records(CoreEntity::Transaction, transaction_records(2));
    harness.client.fail_fetch_call(
        1,
        RemoteError::Rejected {
            operation: "fetch hub-transactions".into(),
            status: 401,
            message: "unauthorised".into(),
        },
    );
    let manager = harness.manager(options(10));

    let result = manager.sync_once(SyncMode::Incremental);

    assert_eq!(result.final_status, RunStatus::Failed);
    assert!(matches!(result.error, Some(SyncError::Configuration { .. })));
    assert_eq!(harness.client.requests().len(), 1);
    assert_eq!(harness.checkpoint().cursor, Cursor::Start);
}

#[rstest]
fn malformed_pages_end_the_run_as_partial(harness: Harness) {
    harness
        .client
        .set_records(CoreEntity::Transaction, transaction_records(4));
    harness.client.fail_fetch_call(
        2,
        RemoteError::Malformed {
            operation: "fetch hub-transactions".into(),
            message: "expected `records`".into(),
        },
    );
    let manager = harness.manager(options(2));

    let result = manager.sync_once(SyncMode::Incremental);

    assert_eq!(result.final_status, RunStatus::Partial);
    assert!(matches!(result.error, Some(SyncError::RemoteData { .. })));
    assert_eq!(harness.checkpoint().cursor, watermark_of(2));
}

#[rstest]
fn cancelled_runs_fetch_nothing(harness: Harness) {
    harness
        .client
        .set_records(CoreEntity::Transaction, transaction_records(2));
    let manager = harness.manager(options(10));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = manager.sync_once_with(SyncMode::Incremental, &cancel);

    assert_eq!(result.final_status, RunStatus::Partial);
    assert!(matches!(result.error, Some(SyncError::Cancelled)));
    assert!(harness.client.requests().is_empty());
}

#[rstest]
fn exhausted_time_budgets_end_as_partial(harness: Harness) {
    harness
        .client
        .set_records(CoreEntity::Transaction, transaction_records(2));
    let manager = harness.manager(options(10).with_timeout(Duration::ZERO));

    let result = manager.sync_once(SyncMode::Incremental);

    assert_eq!(result.final_status, RunStatus::Partial);
    assert!(matches!(result.error, Some(SyncError::TimedOut { .. })));
}

#[rstest]
fn concurrent_runs_are_rejected(harness: Harness) {
    harness
        .client
        .set_records(CoreEntity::Transaction, transaction_records(3));
    let manager = Arc::new(harness.manager(options(10)));
    harness.client.hold_fetches();

    let background = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || manager.sync_once(SyncMode::Incremental))
    };
    harness.client.wait_for_held_fetch();

    let rejected = manager.try_sync_once(SyncMode::Incremental, &CancellationToken::new());
    assert!(matches!(
        rejected,
        Err(SyncError::AlreadyRunning { ref table }) if table == TABLE
    ));

    harness.client.release_fetches();
    let finished = background.join().expect("background run");
    assert!(finished.is_success());
    assert_eq!(harness.store.row_count(TABLE), 3);
}

#[rstest]
fn managers_sharing_a_store_exclude_each_other(harness: Harness) {
    harness
        .client
        .set_records(CoreEntity::Transaction, transaction_records(4));
    let scheduled = Arc::new(harness.manager(options(10)));
    let manual = harness.manager(options(10));
    harness.client.hold_fetches();

    let background = {
        let scheduled = Arc::clone(&scheduled);
        thread::spawn(move || scheduled.sync_once(SyncMode::Incremental))
    };
    harness.client.wait_for_held_fetch();
    assert_eq!(
        harness.store.lease_holder(TABLE).as_deref(),
        Some(scheduled.lease_owner())
    );

    let rejected = manual.try_sync_once(SyncMode::FromScratch, &CancellationToken::new());
    assert!(matches!(
        rejected,
        Err(SyncError::AlreadyRunning { ref table }) if table == TABLE
    ));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let abandoned = manual.sync_once_with(SyncMode::FromScratch, &cancel);
    assert!(matches!(abandoned.error, Some(SyncError::Cancelled)));
    assert_eq!(abandoned.pages_fetched, 0);
    assert_eq!(harness.store.get(TABLE).expect("read checkpoint"), None);
    assert_eq!(harness.client.requests().len(), 1);

    harness.client.release_fetches();
    let finished = background.join().expect("background run");
    assert!(finished.is_success(), "unexpected error: {:?}", finished.error);
    assert_eq!(harness.checkpoint().cursor, watermark_of(4));
    assert_eq!(harness.store.lease_holder(TABLE), None);

    let reload = manual.sync_once(SyncMode::FromScratch);
    assert!(reload.is_success(), "unexpected error: {:?}", reload.error);
    assert_eq!(harness.store.row_count(TABLE), 4);
    assert_eq!(harness.checkpoint().cursor, watermark_of(4));
}

#[rstest]
fn waiting_runs_start_once_the_lease_is_free(harness: Harness) {
    harness
        .client
        .set_records(CoreEntity::Transaction, transaction_records(2));
    let first = Arc::new(harness.manager(options(10)));
    let second = Arc::new(harness.manager(options(10)));
    harness.client.hold_fetches();

    let running = {
        let first = Arc::clone(&first);
        thread::spawn(move || first.sync_once(SyncMode::Incremental))
    };
    harness.client.wait_for_held_fetch();
    let waiting = {
        let second = Arc::clone(&second);
        thread::spawn(move || second.sync_once(SyncMode::FromScratch))
    };
    thread::sleep(Duration::from_millis(100));
    assert_eq!(harness.client.requests().len(), 1);

    harness.client.release_fetches();
    assert!(running.join().expect("first run").is_success());
    let reload = waiting.join().expect("second run");
    assert!(reload.is_success(), "unexpected error: {:?}", reload.error);
    assert_eq!(harness.store.row_count(TABLE), 2);
    assert_eq!(harness.checkpoint().cursor, watermark_of(2));
}

#[rstest]
fn leases_held_elsewhere_reject_runs(harness: Harness) {
    harness
        .store
        .plant_lease(TABLE, "other-process", crate::checkpoint::unix_now());
    let manager = harness.manager(options(10));

    let rejected = manager.try_sync_once(SyncMode::Incremental, &CancellationToken::new());

    assert!(matches!(rejected, Err(SyncError::AlreadyRunning { .. })));
    assert!(harness.client.requests().is_empty());
    assert_eq!(
        harness.store.lease_holder(TABLE).as_deref(),
        Some("other-process")
    );
}

#[rstest]
fn stale_leases_are_taken_over(harness: Harness) {
    harness
        .client
        .set_records(CoreEntity::Transaction, transaction_records(2));
    harness.store.plant_lease(TABLE, "crashed-process", 0);
    let manager = harness.manager(options(10));

    let result = manager.sync_once(SyncMode::Incremental);

    assert!(result.is_success(), "unexpected error: {:?}", result.error);
    assert_eq!(harness.store.row_count(TABLE), 2);
    assert_eq!(harness.store.lease_holder(TABLE), None);
}

#[rstest]
fn runs_that_lose_their_lease_stop_without_committing(harness: Harness) {
    harness
        .client
        .set_records(CoreEntity::Transaction, transaction_records(3));
    let manager = Arc::new(harness.manager(options(10)));
    harness.client.hold_fetches();

    let background = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || manager.sync_once(SyncMode::Incremental))
    };
    harness.client.wait_for_held_fetch();
    harness
        .store
        .plant_lease(TABLE, "takeover", crate::checkpoint::unix_now());
    harness.client.release_fetches();

    let result = background.join().expect("background run");
    assert_eq!(result.final_status, RunStatus::Partial);
    assert!(matches!(result.error, Some(SyncError::LeaseLost { .. })));
    assert_eq!(harness.store.get(TABLE).expect("read checkpoint"), None);
    assert_eq!(harness.store.lease_holder(TABLE).as_deref(), Some("takeover"));
}

#[rstest]
fn never_synced_tables_report_a_fresh_checkpoint(harness: Harness) {
    let manager = harness.manager(options(10));
    let checkpoint = manager.get_checkpoint_status().expect("checkpoint");
    assert_eq!(checkpoint, SyncCheckpoint::never_run(TABLE));
}

#[rstest]
fn blob_listings_are_synced_and_relisted() {
    let storage = StubBlobStorage::with_blob_names("exports", ["a", "b", "c", "d", "e"]);
    let store = Arc::new(MemoryStore::default());
    let manager = SyncManager::new(
        CloudBlobAdapter::new(storage).with_blob_properties(true),
        Arc::clone(&store),
        Arc::clone(&store),
    )
    .with_options(options(2));

    let first = manager.sync_once(SyncMode::Incremental);
    assert!(first.is_success(), "unexpected error: {:?}", first.error);
    assert_eq!(first.pages_fetched, 3);
    assert_eq!(store.row_count("cloudblob"), 5);
    assert_eq!(first.cursor, Cursor::Start);

    manager.adapter().storage().add_blob("f");
    let second = manager.sync_once(SyncMode::Incremental);
    assert!(second.is_success());
    assert_eq!(store.row_count("cloudblob"), 6);
    let probe = manager.reconcile().expect("reconcile");
    assert!(probe.is_in_sync());
    let row = store
        .row("cloudblob", &Scalar::from("f"))
        .expect("blob row");
    assert_eq!(row.columns.get("content_md5"), Some(&json!("md5-f")));
}

#[rstest]
fn blob_listings_resume_from_their_continuation_token() {
    let storage = StubBlobStorage::with_blob_names("exports", ["a", "b", "c"]);
    let store = Arc::new(MemoryStore::default());
    let manager = SyncManager::new(
        CloudBlobAdapter::new(storage),
        Arc::clone(&store),
        Arc::clone(&store),
    )
    .with_options(options(2).with_max_pages(1));

    let first = manager.sync_once(SyncMode::Incremental);
    assert_eq!(first.cursor, Cursor::token("2"));
    let second = manager.sync_once(SyncMode::Incremental);
    assert_eq!(second.rows_written, 1);
    assert_eq!(second.cursor, Cursor::Start);
    assert_eq!(store.row_count("cloudblob"), 3);
}

/// Adapter whose source keeps returning the same page without a marker.
struct RepeatingAdapter {
    table: TableSpec,
}

impl EntityAdapter for RepeatingAdapter {
    fn table(&self) -> &TableSpec {
        &self.table
    }

    fn count(&self) -> Result<u64, RemoteError> {
        Ok(1)
    }

    fn fetch_page(&self, _cursor: &Cursor, _page_size: usize) -> Result<Page, RemoteError> {
        let record = SourceRecord::from_value(json!({"id": 1})).unwrap_or_default();
        Ok(Page::new(vec![record]))
    }
}

#[rstest]
fn stalled_cursors_stop_the_run() {
    let store = Arc::new(MemoryStore::default());
    let manager = SyncManager::new(
        RepeatingAdapter {
            table: TableSpec::new("loops", "id", None, ["value"]).expect("table"),
        },
        Arc::clone(&store),
        Arc::clone(&store),
    );

    let result = manager.sync_once(SyncMode::Incremental);

    assert_eq!(result.final_status, RunStatus::Partial);
    let error = result.error.expect("stalled runs report why");
    assert!(matches!(
        error,
        SyncError::CursorStalled { cursor: Cursor::Start, .. }
    ));
    assert!(
        error.to_string().contains(r#"first record on the page: {"id":1}"#),
        "{error}"
    );
    assert_eq!(result.pages_fetched, 1);
}

#[rstest]
#[case("incremental", SyncMode::Incremental)]
#[case("from_scratch", SyncMode::FromScratch)]
#[case("From-Scratch", SyncMode::FromScratch)]
#[case("full", SyncMode::FromScratch)]
fn sync_modes_parse_from_labels(#[case] label: &str, #[case] mode: SyncMode) {
    assert_eq!(label.parse::<SyncMode>(), Ok(mode));
}
