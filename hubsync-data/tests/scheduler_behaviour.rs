//! Behavioural tests for the per-table scheduler.

use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hubsync_core::test_support::{MemoryStore, StubCoreClient, transaction_records};
use hubsync_core::{
    CheckpointStore, CoreEntity, CoreEntityAdapter, RetryPolicy, RunStatus, SyncManager,
    SyncOptions,
};
use hubsync_data::schedule::{Scheduler, TableActivity, TableSchedule};
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tokio_util::sync::CancellationToken;

const TABLE: &str = "hubtransaction";

struct SchedulerWorld {
    client: Arc<StubCoreClient>,
    store: Arc<MemoryStore>,
    page_size: Cell<usize>,
    schedule: RefCell<Option<TableSchedule>>,
    activity: RefCell<Vec<TableActivity>>,
}

impl SchedulerWorld {
    fn scheduler(&self) -> Scheduler {
        let options = SyncOptions::default()
            .with_page_size(self.page_size.get())
            .with_retry(RetryPolicy::none());
        let manager = SyncManager::new(
            CoreEntityAdapter::new(Arc::clone(&self.client), CoreEntity::Transaction),
            Arc::clone(&self.store),
            Arc::clone(&self.store),
        )
        .with_options(options);
        let schedule = self
            .schedule
            .borrow()
            .clone()
            .unwrap_or_else(|| panic!("a schedule must be configured"));

        let mut scheduler = Scheduler::new();
        scheduler
            .register(schedule, Arc::new(manager))
            .unwrap_or_else(|err| panic!("registration failed: {err}"));
        scheduler
    }

    /// Start the scheduler, call `until` on this thread, then shut down and
    /// collect the activity report. `until` may cancel the token early.
    fn run_until(&self, until: impl FnOnce(&CancellationToken)) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap_or_else(|err| panic!("runtime: {err}"));
        let shutdown = CancellationToken::new();
        let handle = runtime.spawn(self.scheduler().run(shutdown.clone()));

        until(&shutdown);
        shutdown.cancel();
        let activity = runtime
            .block_on(handle)
            .unwrap_or_else(|err| panic!("scheduler task failed: {err}"));
        *self.activity.borrow_mut() = activity;
    }

    fn checkpoint_status(&self) -> RunStatus {
        self.store
            .get(TABLE)
            .unwrap_or_else(|err| panic!("read checkpoint: {err}"))
            .unwrap_or_else(|| panic!("checkpoint stored"))
            .last_run_status
    }
}

#[fixture]
fn world() -> SchedulerWorld {
    SchedulerWorld {
        client: Arc::new(StubCoreClient::default()),
        store: Arc::new(MemoryStore::default()),
        page_size: Cell::new(100),
        schedule: RefCell::new(None),
        activity: RefCell::new(Vec::new()),
    }
}

// --- Given steps ---

#[given("a Core source with {count} transactions")]
fn source_with_transactions(world: &SchedulerWorld, count: usize) {
    world
        .client
        .set_records(CoreEntity::Transaction, transaction_records(count));
}

#[given("pages of {page_size} records")]
fn paged_runs(world: &SchedulerWorld, page_size: usize) {
    world.page_size.set(page_size);
}

#[given("the transaction table is scheduled every {secs} seconds")]
fn scheduled(world: &SchedulerWorld, secs: u64) {
    *world.schedule.borrow_mut() = Some(TableSchedule::every(TABLE, secs));
}

#[given("the transaction table is scheduled every {secs} seconds but disabled")]
fn scheduled_but_disabled(world: &SchedulerWorld, secs: u64) {
    *world.schedule.borrow_mut() = Some(TableSchedule::every(TABLE, secs).disabled());
}

// --- When steps ---

#[when("the scheduler runs until the local table holds {rows} rows")]
fn run_until_synced(world: &SchedulerWorld, rows: usize) {
    let store = Arc::clone(&world.store);
    world.run_until(move |_| {
        let deadline = Instant::now() + Duration::from_secs(10);
        while store.row_count(TABLE) < rows {
            assert!(Instant::now() < deadline, "rows never arrived");
            thread::sleep(Duration::from_millis(10));
        }
    });
}

#[when("the scheduler runs briefly")]
fn run_briefly(world: &SchedulerWorld) {
    world.run_until(|_| thread::sleep(Duration::from_millis(50)));
}

#[when("the scheduler is shut down while the first page is in flight")]
fn shut_down_mid_run(world: &SchedulerWorld) {
    world.client.hold_fetches();
    let client = Arc::clone(&world.client);
    world.run_until(move |shutdown| {
        client.wait_for_held_fetch();
        shutdown.cancel();
        client.release_fetches();
    });
}

// --- Then steps ---

#[then("the scheduler reports {runs} successful run of the transaction table")]
fn reports_runs(world: &SchedulerWorld, runs: u64) {
    let activity = world.activity.borrow();
    let table = activity
        .iter()
        .find(|entry| entry.table == TABLE)
        .unwrap_or_else(|| panic!("no activity for {TABLE}"));
    assert_eq!(table.runs, runs);
    assert_eq!(table.unsuccessful_runs, 0);
    assert_eq!(table.last_status, Some(RunStatus::Success));
}

#[then("the scheduler reports no activity")]
fn reports_nothing(world: &SchedulerWorld) {
    assert!(world.activity.borrow().is_empty());
}

#[then("no transactions were requested")]
fn nothing_requested(world: &SchedulerWorld) {
    assert!(world.client.requests().is_empty());
}

#[then("the local table holds {rows} rows")]
fn local_rows(world: &SchedulerWorld, rows: usize) {
    assert_eq!(world.store.row_count(TABLE), rows);
}

#[then("the checkpoint is marked success")]
fn checkpoint_success(world: &SchedulerWorld) {
    assert_eq!(world.checkpoint_status(), RunStatus::Success);
}

#[then("the checkpoint is marked partial")]
fn checkpoint_partial(world: &SchedulerWorld) {
    assert_eq!(world.checkpoint_status(), RunStatus::Partial);
}

// --- Scenario registrations ---

#[scenario(path = "tests/features/scheduler.feature", index = 0)]
fn enabled_table_syncs(world: SchedulerWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/scheduler.feature", index = 1)]
fn disabled_table_never_syncs(world: SchedulerWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/scheduler.feature", index = 2)]
fn shutdown_stops_in_flight_run(world: SchedulerWorld) {
    let _ = world;
}
