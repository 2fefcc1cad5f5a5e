use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use chrono::NaiveDate;
use ingestion::{
    BranchBatch, DevicePush, IngestError, PromotionRequest, accept_device_push,
    ingest_branch_batch, promote_pending,
    transport::{AttendanceRuntime, HttpRequest, handle_request},
};
use schema::{
    AttendanceEvent, Branch, BranchId, DeadLetteredEvent, Employee, NewAttendanceEvent,
    NewQuarantinedEvent, QuarantinedEvent, SyncStatus,
};
use serde_json::{Value, json};
use store::{
    AttendanceStats, BranchName, BranchOverview, DedupStore, InMemoryStore, InsertOutcome,
    PromotionOutcome, QueueDepth, StoreError,
};

/// Delegates to an in-memory store but fails selected writes on demand.
struct FlakyStore {
    inner: InMemoryStore,
    fail_inserts: AtomicBool,
    fail_dead_letters: AtomicBool,
    failing_branch: Mutex<Option<BranchId>>,
    taken_after_read: Mutex<Option<u64>>,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            fail_inserts: AtomicBool::new(false),
            fail_dead_letters: AtomicBool::new(false),
            failing_branch: Mutex::new(None),
            taken_after_read: Mutex::new(None),
        }
    }

    fn arm(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    fn fail_dead_letters(&self, fail: bool) {
        self.fail_dead_letters.store(fail, Ordering::SeqCst);
    }

    fn fail_branch(&self, branch_id: Option<BranchId>) {
        *self.failing_branch.lock().unwrap() = branch_id;
    }

    /// Removes `queue_id` right after the next pending read, as a competing
    /// promotion run would.
    fn take_after_read(&self, queue_id: u64) {
        *self.taken_after_read.lock().unwrap() = Some(queue_id);
    }
}

impl DedupStore for FlakyStore {
    fn upsert_branch(
        &self,
        branch_id: BranchId,
        name: BranchName,
        token: Option<&str>,
    ) -> Result<Branch, StoreError> {
        if *self.failing_branch.lock().unwrap() == Some(branch_id) {
            return Err(StoreError::Io("disk full".to_string()));
        }
        self.inner.upsert_branch(branch_id, name, token)
    }

    fn insert_event_if_absent(
        &self,
        event: NewAttendanceEvent,
    ) -> Result<InsertOutcome, StoreError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Io("disk full".to_string()));
        }
        self.inner.insert_event_if_absent(event)
    }

    fn upsert_employee(
        &self,
        branch_id: BranchId,
        employee_id: &str,
        name: &str,
        card_number: Option<&str>,
    ) -> Result<Employee, StoreError> {
        self.inner
            .upsert_employee(branch_id, employee_id, name, card_number)
    }

    fn record_sync_success(&self, branch_id: BranchId) -> Result<SyncStatus, StoreError> {
        self.inner.record_sync_success(branch_id)
    }

    fn record_sync_failure(
        &self,
        branch_id: BranchId,
        error: &str,
    ) -> Result<SyncStatus, StoreError> {
        self.inner.record_sync_failure(branch_id, error)
    }

    fn enqueue_quarantined(&self, record: NewQuarantinedEvent) -> Result<Option<u64>, StoreError> {
        self.inner.enqueue_quarantined(record)
    }

    fn pending_quarantined(&self, max_rows: usize) -> Result<Vec<QuarantinedEvent>, StoreError> {
        let pending = self.inner.pending_quarantined(max_rows)?;
        if let Some(queue_id) = self.taken_after_read.lock().unwrap().take() {
            self.inner.dead_letter_quarantined(queue_id, "taken by another run")?;
        }
        Ok(pending)
    }

    fn promote_quarantined(
        &self,
        queue_id: u64,
        event: NewAttendanceEvent,
    ) -> Result<PromotionOutcome, StoreError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Io("disk full".to_string()));
        }
        self.inner.promote_quarantined(queue_id, event)
    }

    fn dead_letter_quarantined(&self, queue_id: u64, reason: &str) -> Result<bool, StoreError> {
        if self.fail_dead_letters.load(Ordering::SeqCst) {
            return Err(StoreError::Io("disk full".to_string()));
        }
        self.inner.dead_letter_quarantined(queue_id, reason)
    }

    fn branch(&self, branch_id: BranchId) -> Result<Option<Branch>, StoreError> {
        self.inner.branch(branch_id)
    }

    fn event(&self, event_id: &str) -> Result<Option<AttendanceEvent>, StoreError> {
        self.inner.event(event_id)
    }

    fn employee(
        &self,
        branch_id: BranchId,
        employee_id: &str,
    ) -> Result<Option<Employee>, StoreError> {
        self.inner.employee(branch_id, employee_id)
    }

    fn sync_status(&self, branch_id: BranchId) -> Result<Option<SyncStatus>, StoreError> {
        self.inner.sync_status(branch_id)
    }

    fn events_len(&self) -> Result<usize, StoreError> {
        self.inner.events_len()
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetteredEvent>, StoreError> {
        self.inner.dead_letters()
    }

    fn queue_depth(&self) -> Result<QueueDepth, StoreError> {
        self.inner.queue_depth()
    }

    fn attendance_stats(&self, today: NaiveDate) -> Result<AttendanceStats, StoreError> {
        self.inner.attendance_stats(today)
    }

    fn branch_overview(&self) -> Result<Vec<BranchOverview>, StoreError> {
        self.inner.branch_overview()
    }
}

fn batch(branch_id: BranchId, logs: Vec<Value>) -> BranchBatch {
    BranchBatch {
        branch_id,
        branch_name: Some(format!("Site {branch_id}")),
        access_token: None,
        attendance_logs: logs,
        employees: vec![],
    }
}

fn log(event_id: &str, user_id: &str) -> Value {
    json!({"event_id": event_id, "user_id": user_id, "timestamp": "2024-01-01 09:00:00"})
}

fn device_push(branch_id: &str, records: Vec<Value>) -> DevicePush {
    DevicePush {
        event_type: Some("attendance".to_string()),
        branch_id: branch_id.to_string(),
        records,
    }
}

#[test]
fn resubmitted_batch_inserts_nothing_new() {
    let store = InMemoryStore::new();
    let logs = vec![log("e1", "42"), log("e2", "43"), log("e3", "44")];

    let first = ingest_branch_batch(&store, batch(1, logs.clone())).unwrap();
    let second = ingest_branch_batch(&store, batch(1, logs)).unwrap();

    assert_eq!(first.inserted(), 3);
    assert_eq!(second.inserted(), 0);
    assert_eq!(second.duplicates(), 3);
    assert_eq!(store.events_len().unwrap(), 3);
}

#[test]
fn concurrent_branches_never_duplicate_an_event_id() {
    let store = InMemoryStore::new();
    let shared: Vec<Value> = (0..50).map(|i| log(&format!("shared-{i}"), "7")).collect();

    let inserted: usize = thread::scope(|scope| {
        let handles: Vec<_> = (1..=8)
            .map(|branch_id| {
                let store = &store;
                let logs = shared.clone();
                scope.spawn(move || {
                    ingest_branch_batch(store, batch(branch_id, logs))
                        .unwrap()
                        .inserted()
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).sum()
    });

    assert_eq!(inserted, 50);
    assert_eq!(store.events_len().unwrap(), 50);
    for branch_id in 1..=8 {
        assert_eq!(store.sync_status(branch_id).unwrap().unwrap().sync_count, 1);
    }
}

#[test]
fn concurrent_promotions_move_each_queued_row_once() {
    let store = InMemoryStore::new();
    let records: Vec<Value> = (0..40)
        .map(|i| json!({"user_id": format!("{i}"), "timestamp": "2024-01-01 08:00:00"}))
        .collect();
    accept_device_push(&store, device_push("5", records)).unwrap();

    let inserted: usize = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = &store;
                scope.spawn(move || {
                    promote_pending(
                        store,
                        PromotionRequest {
                            max_rows: 15,
                            branch_override: None,
                        },
                    )
                    .unwrap()
                    .inserted
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).sum()
    });

    let depth = store.queue_depth().unwrap();
    assert_eq!(inserted + depth.pending_attendance, 40);
    assert_eq!(store.events_len().unwrap(), inserted);
}

#[test]
fn every_queued_record_ends_in_log_or_dead_letters() {
    let store = InMemoryStore::new();
    accept_device_push(
        &store,
        device_push(
            "9",
            vec![
                json!({"user_id": "1", "timestamp": "2024-01-01 08:00:00", "event_id": "d1"}),
                json!({"user_id": "", "timestamp": "2024-01-01 08:00:00"}),
                json!({"user_id": "3", "timestamp": "2024-01-01 08:01:00"}),
            ],
        ),
    )
    .unwrap();
    accept_device_push(
        &store,
        device_push(
            "north",
            vec![json!({"user_id": "4", "timestamp": "2024-01-01 08:02:00"})],
        ),
    )
    .unwrap();

    let report = promote_pending(&store, PromotionRequest::default()).unwrap();

    assert_eq!(report.examined, 4);
    assert_eq!(report.inserted, 2);
    assert_eq!(report.dead_lettered, 2);
    assert_eq!(store.events_len().unwrap(), 2);
    assert_eq!(store.dead_letters().unwrap().len(), 2);
    assert_eq!(store.queue_depth().unwrap().pending_attendance, 0);
}

#[test]
fn trusted_path_counts_duplicate_batches_but_promotion_does_not() {
    let store = InMemoryStore::new();
    ingest_branch_batch(&store, batch(3, vec![log("t1", "1")])).unwrap();
    ingest_branch_batch(&store, batch(3, vec![log("t1", "1")])).unwrap();
    assert_eq!(store.sync_status(3).unwrap().unwrap().sync_count, 2);

    // Already in the canonical log, so promotion inserts nothing.
    accept_device_push(
        &store,
        device_push(
            "3",
            vec![json!({"user_id": "1", "timestamp": "2024-01-01 09:00:00", "event_id": "t1"})],
        ),
    )
    .unwrap();
    let report = promote_pending(&store, PromotionRequest::default()).unwrap();
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.synced_branch, None);
    assert_eq!(store.sync_status(3).unwrap().unwrap().sync_count, 2);

    accept_device_push(
        &store,
        device_push(
            "3",
            vec![json!({"user_id": "1", "timestamp": "2024-01-01 17:00:00", "event_id": "t2"})],
        ),
    )
    .unwrap();
    promote_pending(&store, PromotionRequest::default()).unwrap();
    assert_eq!(store.sync_status(3).unwrap().unwrap().sync_count, 3);
}

#[test]
fn empty_device_event_ids_become_distinct_canonical_ids() {
    let runtime = AttendanceRuntime::new(Arc::new(InMemoryStore::new()));
    let push = HttpRequest::new("POST", "/api/v1/adms/push").with_json_body(
        r#"{"event_type":"attendance","branch_id":"2","data":[
            {"user_id":"10","timestamp":"2024-01-01 08:00:00","event_id":""},
            {"user_id":"11","timestamp":"2024-01-01 08:00:00","event_id":""}
        ]}"#,
    );
    let queued = handle_request(&runtime, &push);
    assert!(queued.body.contains("\"records_queued\":2"));

    let promoted = handle_request(&runtime, &HttpRequest::new("POST", "/api/v1/adms/promote"));
    assert!(promoted.body.contains("\"moved\":2"));

    let first = runtime.store().event("adms-1").unwrap().unwrap();
    let second = runtime.store().event("adms-2").unwrap().unwrap();
    assert_eq!(first.employee_id, "10");
    assert_eq!(second.employee_id, "11");
    assert_eq!(first.machine_id.as_deref(), Some("ADMS"));
    assert_eq!(
        runtime.store().branch(2).unwrap().unwrap().branch_name,
        "ADMS Branch"
    );
}

#[test]
fn storage_failure_records_error_and_keeps_log_unchanged() {
    let store = Arc::new(FlakyStore::new());
    ingest_branch_batch(store.as_ref(), batch(4, vec![log("ok-1", "1")])).unwrap();

    store.arm(true);
    let err = ingest_branch_batch(store.as_ref(), batch(4, vec![log("lost-1", "2")])).unwrap_err();
    assert_eq!(
        err,
        IngestError::Store(StoreError::Io("disk full".to_string()))
    );

    let status = store.sync_status(4).unwrap().unwrap();
    assert_eq!(status.sync_count, 1);
    assert!(status.last_error.as_deref().unwrap().contains("disk full"));
    assert_eq!(store.events_len().unwrap(), 1);

    // Recovery clears the error.
    store.arm(false);
    ingest_branch_batch(store.as_ref(), batch(4, vec![log("lost-1", "2")])).unwrap();
    let status = store.sync_status(4).unwrap().unwrap();
    assert_eq!(status.sync_count, 2);
    assert_eq!(status.last_error, None);
}

#[test]
fn storage_failure_surfaces_as_server_error_over_http() {
    let store = Arc::new(FlakyStore::new());
    store.arm(true);
    let runtime = AttendanceRuntime::new(store.clone());

    let response = handle_request(
        &runtime,
        &HttpRequest::new("POST", "/api/v1/attendance/push").with_json_body(
            r#"{"branch_id":8,"branch_name":"Depot","data":{"attendance_logs":[
                {"user_id":"1","timestamp":"2024-01-01 09:00:00","event_id":"x1"}
            ]}}"#,
        ),
    );

    assert_eq!(response.status, 500);
    assert!(response.body.contains("disk full"));
    assert_eq!(store.events_len().unwrap(), 0);
    assert!(
        runtime
            .metrics_text()
            .contains("punchhub_storage_failures_total 1")
    );
}

fn queue_one_per_branch(store: &dyn DedupStore, branches: &[&str]) {
    for (index, branch) in branches.iter().enumerate() {
        accept_device_push(
            store,
            device_push(
                branch,
                vec![json!({
                    "user_id": format!("{index}"),
                    "timestamp": "2024-01-01 08:00:00",
                    "event_id": format!("row-{branch}"),
                })],
            ),
        )
        .unwrap();
    }
}

#[test]
fn promotion_continues_past_a_record_whose_storage_write_fails() {
    let store = FlakyStore::new();
    queue_one_per_branch(&store, &["1", "2", "3"]);
    store.fail_branch(Some(2));

    let report = promote_pending(&store, PromotionRequest::default()).unwrap();

    assert_eq!(report.examined, 3);
    assert_eq!(report.inserted, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.synced_branch, Some(3));
    assert!(store.event("row-1").unwrap().is_some());
    assert!(store.event("row-2").unwrap().is_none());
    assert!(store.event("row-3").unwrap().is_some());

    let depth = store.queue_depth().unwrap();
    assert_eq!(depth.pending_attendance, 0);
    assert_eq!(depth.dead_lettered, 1);
    let dead = store.dead_letters().unwrap();
    assert_eq!(dead[0].record.event_id.as_deref(), Some("row-2"));
    assert!(dead[0].reason.contains("disk full"));
    assert_eq!(store.sync_status(3).unwrap().unwrap().sync_count, 1);
}

#[test]
fn promotion_leaves_row_queued_when_dead_lettering_also_fails() {
    let store = FlakyStore::new();
    queue_one_per_branch(&store, &["4", "5"]);
    store.fail_branch(Some(4));
    store.fail_dead_letters(true);

    let report = promote_pending(&store, PromotionRequest::default()).unwrap();

    assert_eq!(report.inserted, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.dead_lettered, 0);
    assert_eq!(store.queue_depth().unwrap().pending_attendance, 1);
    assert_eq!(store.sync_status(5).unwrap().unwrap().sync_count, 1);

    // Once storage recovers the stuck row goes through.
    store.fail_branch(None);
    store.fail_dead_letters(false);
    let report = promote_pending(&store, PromotionRequest::default()).unwrap();
    assert_eq!(report.inserted, 1);
    assert!(store.event("row-4").unwrap().is_some());
    assert_eq!(store.queue_depth().unwrap().pending_attendance, 0);
}

#[test]
fn promotion_storage_failures_show_in_metrics() {
    let store = Arc::new(FlakyStore::new());
    queue_one_per_branch(store.as_ref(), &["6", "7"]);
    store.fail_branch(Some(6));
    let runtime = AttendanceRuntime::new(store.clone());

    let response = handle_request(&runtime, &HttpRequest::new("POST", "/api/v1/adms/promote"));

    assert_eq!(response.status, 200);
    assert!(response.body.contains("\"moved\":1"));
    let metrics = runtime.metrics_text();
    assert!(metrics.contains("punchhub_storage_failures_total 1"));
    assert!(metrics.contains("punchhub_records_dead_lettered_total 1"));
}

#[test]
fn promotion_syncs_branch_of_last_row_it_actually_processed() {
    let store = FlakyStore::new();
    queue_one_per_branch(&store, &["8", "9"]);
    let last = store.pending_quarantined(10).unwrap()[1].queue_id;
    store.take_after_read(last);

    let report = promote_pending(&store, PromotionRequest::default()).unwrap();

    assert_eq!(report.inserted, 1);
    assert_eq!(report.already_removed, 1);
    assert_eq!(report.synced_branch, Some(8));
    assert_eq!(store.sync_status(8).unwrap().unwrap().sync_count, 1);
    assert_eq!(store.sync_status(9).unwrap(), None);
}
