mod wal;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Mutex, MutexGuard},
};

use chrono::NaiveDate;
use schema::{
    AttendanceEvent, Branch, BranchId, DeadLetteredEvent, Employee, NewAttendanceEvent,
    NewQuarantinedEvent, QuarantinedEvent, SyncStatus, ValidationError, calendar_date,
    now_timestamp, validate_event,
};
use serde::Serialize;
use tracing::{debug, warn};

use wal::PersistedRecord;
pub use wal::{CheckpointPolicy, FileWal, WalCheckpointStats, WalReplayStats, WalWritePolicy};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("store lock poisoned")]
    Poisoned,
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

/// How `upsert_branch` treats the display name of an existing branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchName {
    /// Overwrite whatever is stored.
    Replace(String),
    /// Keep a stored non-blank name, else use this one.
    KeepOr(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

impl InsertOutcome {
    pub fn is_inserted(self) -> bool {
        matches!(self, Self::Inserted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionOutcome {
    Inserted,
    Duplicate,
    /// Another promotion run already took the queue row.
    AlreadyRemoved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceStats {
    pub total_branches: usize,
    pub total_records: usize,
    pub today_records: usize,
    pub unsynced_records: usize,
    pub latest_record: Option<String>,
    pub earliest_record: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub pending_attendance: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchOverview {
    pub branch_id: BranchId,
    pub branch_name: String,
    pub is_active: bool,
    pub created_at: String,
    pub last_sync: Option<String>,
    pub sync_count: u64,
    pub last_error: Option<String>,
    pub event_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreLoadStats {
    pub replay: WalReplayStats,
    pub branches_loaded: usize,
    pub events_loaded: usize,
    pub queued_loaded: usize,
}

/// Durable home of every table. Each method is one atomic step; callers
/// never hold state of their own between calls.
pub trait DedupStore: Send + Sync {
    fn upsert_branch(
        &self,
        branch_id: BranchId,
        name: BranchName,
        token: Option<&str>,
    ) -> Result<Branch, StoreError>;

    fn insert_event_if_absent(&self, event: NewAttendanceEvent)
    -> Result<InsertOutcome, StoreError>;

    fn upsert_employee(
        &self,
        branch_id: BranchId,
        employee_id: &str,
        name: &str,
        card_number: Option<&str>,
    ) -> Result<Employee, StoreError>;

    fn record_sync_success(&self, branch_id: BranchId) -> Result<SyncStatus, StoreError>;

    fn record_sync_failure(&self, branch_id: BranchId, error: &str)
    -> Result<SyncStatus, StoreError>;

    /// Returns the assigned queue id, or `None` when a record with the same
    /// non-empty event id is already waiting.
    fn enqueue_quarantined(&self, record: NewQuarantinedEvent) -> Result<Option<u64>, StoreError>;

    /// Oldest first.
    fn pending_quarantined(&self, max_rows: usize) -> Result<Vec<QuarantinedEvent>, StoreError>;

    /// Inserts the event if absent and removes the queue row in one step.
    fn promote_quarantined(
        &self,
        queue_id: u64,
        event: NewAttendanceEvent,
    ) -> Result<PromotionOutcome, StoreError>;

    /// Moves the queue row to the dead-letter table. False if it was gone.
    fn dead_letter_quarantined(&self, queue_id: u64, reason: &str) -> Result<bool, StoreError>;

    fn branch(&self, branch_id: BranchId) -> Result<Option<Branch>, StoreError>;
    fn event(&self, event_id: &str) -> Result<Option<AttendanceEvent>, StoreError>;
    fn employee(
        &self,
        branch_id: BranchId,
        employee_id: &str,
    ) -> Result<Option<Employee>, StoreError>;
    fn sync_status(&self, branch_id: BranchId) -> Result<Option<SyncStatus>, StoreError>;
    fn events_len(&self) -> Result<usize, StoreError>;
    fn dead_letters(&self) -> Result<Vec<DeadLetteredEvent>, StoreError>;
    fn queue_depth(&self) -> Result<QueueDepth, StoreError>;
    fn attendance_stats(&self, today: NaiveDate) -> Result<AttendanceStats, StoreError>;
    fn branch_overview(&self) -> Result<Vec<BranchOverview>, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    branches: BTreeMap<BranchId, Branch>,
    events: BTreeMap<String, AttendanceEvent>,
    employees: BTreeMap<(BranchId, String), Employee>,
    sync_status: BTreeMap<BranchId, SyncStatus>,
    queue: BTreeMap<u64, QuarantinedEvent>,
    queued_event_ids: HashMap<String, u64>,
    dead_letters: Vec<DeadLetteredEvent>,
    next_queue_id: u64,
}

impl Tables {
    fn apply(&mut self, record: PersistedRecord) {
        match record {
            PersistedRecord::Branch(branch) => {
                self.branches.insert(branch.branch_id, branch);
            }
            PersistedRecord::Event(event) => {
                self.events.insert(event.event_id.clone(), event);
            }
            PersistedRecord::Employee(employee) => {
                self.employees.insert(
                    (employee.branch_id, employee.employee_id.clone()),
                    employee,
                );
            }
            PersistedRecord::SyncStatus(status) => {
                self.sync_status.insert(status.branch_id, status);
            }
            PersistedRecord::Queued(record) => {
                if let Some(key) = queue_key(&record.event_id) {
                    self.queued_event_ids.insert(key.to_string(), record.queue_id);
                }
                self.next_queue_id = self.next_queue_id.max(record.queue_id + 1);
                self.queue.insert(record.queue_id, record);
            }
            PersistedRecord::Dequeued { queue_id } => {
                self.remove_queued(queue_id);
            }
            PersistedRecord::DeadLettered(dead) => {
                self.remove_queued(dead.record.queue_id);
                self.next_queue_id = self.next_queue_id.max(dead.record.queue_id + 1);
                self.dead_letters.push(dead);
            }
            PersistedRecord::QueueSequence { next_queue_id } => {
                self.next_queue_id = self.next_queue_id.max(next_queue_id);
            }
        }
    }

    fn remove_queued(&mut self, queue_id: u64) -> Option<QuarantinedEvent> {
        let record = self.queue.remove(&queue_id)?;
        if let Some(key) = queue_key(&record.event_id)
            && self.queued_event_ids.get(key) == Some(&queue_id)
        {
            self.queued_event_ids.remove(key);
        }
        Some(record)
    }

    fn allocate_queue_id(&self) -> u64 {
        self.next_queue_id.max(1)
    }

    fn snapshot_records(&self) -> Vec<PersistedRecord> {
        let mut records = Vec::with_capacity(
            self.branches.len()
                + self.events.len()
                + self.employees.len()
                + self.sync_status.len()
                + self.queue.len()
                + self.dead_letters.len()
                + 1,
        );
        records.extend(self.branches.values().cloned().map(PersistedRecord::Branch));
        records.extend(self.events.values().cloned().map(PersistedRecord::Event));
        records.extend(self.employees.values().cloned().map(PersistedRecord::Employee));
        records.extend(
            self.sync_status
                .values()
                .cloned()
                .map(PersistedRecord::SyncStatus),
        );
        records.extend(self.queue.values().cloned().map(PersistedRecord::Queued));
        records.extend(
            self.dead_letters
                .iter()
                .cloned()
                .map(PersistedRecord::DeadLettered),
        );
        // Deleted rows leave no trace in a snapshot; the sequence keeps their ids retired.
        records.push(PersistedRecord::QueueSequence {
            next_queue_id: self.allocate_queue_id(),
        });
        records
    }
}

fn queue_key(event_id: &Option<String>) -> Option<&str> {
    event_id
        .as_deref()
        .filter(|event_id| !event_id.trim().is_empty())
}

fn issue_branch_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Default)]
struct StoreState {
    tables: Tables,
    wal: Option<FileWal>,
    checkpoint_policy: CheckpointPolicy,
}

impl StoreState {
    /// Logs the record, then applies it. A failed append changes nothing.
    fn commit(&mut self, record: PersistedRecord) -> Result<(), StoreError> {
        if let Some(wal) = self.wal.as_mut() {
            wal.append_record(&record)?;
        }
        self.tables.apply(record);
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<Option<WalCheckpointStats>, StoreError> {
        let Some(wal) = self.wal.as_mut() else {
            return Ok(None);
        };
        let records = self.tables.snapshot_records();
        wal.compact_with_snapshot(&records).map(Some)
    }

    fn checkpoint_if_due(&mut self) {
        let due = match self.wal.as_ref() {
            Some(wal) => wal.should_checkpoint(&self.checkpoint_policy),
            None => return,
        };
        match due {
            Ok(true) => match self.checkpoint() {
                Ok(Some(stats)) => debug!(
                    snapshot_records = stats.snapshot_records,
                    truncated_wal_records = stats.truncated_wal_records,
                    "store checkpoint completed"
                ),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "store checkpoint failed"),
            },
            Ok(false) => {}
            Err(err) => warn!(error = %err, "store checkpoint check failed"),
        }
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replays the snapshot and WAL, then keeps logging every mutation.
    pub fn persistent(
        wal: FileWal,
        checkpoint_policy: CheckpointPolicy,
    ) -> Result<(Self, StoreLoadStats), StoreError> {
        let (records, replay) = wal.replay_records_with_stats()?;
        let mut tables = Tables::default();
        for record in records {
            tables.apply(record);
        }
        let stats = StoreLoadStats {
            replay,
            branches_loaded: tables.branches.len(),
            events_loaded: tables.events.len(),
            queued_loaded: tables.queue.len(),
        };
        let store = Self {
            state: Mutex::new(StoreState {
                tables,
                wal: Some(wal),
                checkpoint_policy,
            }),
        };
        Ok((store, stats))
    }

    pub fn checkpoint_and_compact(&self) -> Result<Option<WalCheckpointStats>, StoreError> {
        self.lock()?.checkpoint()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl DedupStore for InMemoryStore {
    fn upsert_branch(
        &self,
        branch_id: BranchId,
        name: BranchName,
        token: Option<&str>,
    ) -> Result<Branch, StoreError> {
        let mut state = self.lock()?;
        let existing = state.tables.branches.get(&branch_id);
        let branch_name = match name {
            BranchName::Replace(name) => name,
            BranchName::KeepOr(fallback) => existing
                .map(|branch| branch.branch_name.clone())
                .filter(|name| !name.trim().is_empty())
                .unwrap_or(fallback),
        };
        let access_token = match token {
            Some(token) => token.to_string(),
            None => existing
                .map(|branch| branch.access_token.clone())
                .unwrap_or_else(issue_branch_token),
        };
        let created_at = existing
            .map(|branch| branch.created_at.clone())
            .unwrap_or_else(now_timestamp);
        let branch = Branch {
            branch_id,
            branch_name,
            access_token,
            is_active: true,
            created_at,
        };
        state.commit(PersistedRecord::Branch(branch.clone()))?;
        state.checkpoint_if_due();
        Ok(branch)
    }

    fn insert_event_if_absent(
        &self,
        event: NewAttendanceEvent,
    ) -> Result<InsertOutcome, StoreError> {
        validate_event(&event)?;
        let mut state = self.lock()?;
        if state.tables.events.contains_key(&event.event_id) {
            return Ok(InsertOutcome::Duplicate);
        }
        let row = AttendanceEvent::from_new(event, now_timestamp());
        state.commit(PersistedRecord::Event(row))?;
        state.checkpoint_if_due();
        Ok(InsertOutcome::Inserted)
    }

    fn upsert_employee(
        &self,
        branch_id: BranchId,
        employee_id: &str,
        name: &str,
        card_number: Option<&str>,
    ) -> Result<Employee, StoreError> {
        if employee_id.trim().is_empty() {
            return Err(ValidationError::MissingField("user_id").into());
        }
        let employee = Employee {
            branch_id,
            employee_id: employee_id.to_string(),
            name: name.to_string(),
            card_number: card_number.map(str::to_string),
            updated_at: now_timestamp(),
        };
        let mut state = self.lock()?;
        state.commit(PersistedRecord::Employee(employee.clone()))?;
        state.checkpoint_if_due();
        Ok(employee)
    }

    fn record_sync_success(&self, branch_id: BranchId) -> Result<SyncStatus, StoreError> {
        let mut state = self.lock()?;
        let now = now_timestamp();
        let previous_count = state
            .tables
            .sync_status
            .get(&branch_id)
            .map_or(0, |status| status.sync_count);
        let status = SyncStatus {
            branch_id,
            last_sync: Some(now.clone()),
            sync_count: previous_count + 1,
            last_error: None,
            updated_at: now,
        };
        state.commit(PersistedRecord::SyncStatus(status.clone()))?;
        state.checkpoint_if_due();
        Ok(status)
    }

    fn record_sync_failure(
        &self,
        branch_id: BranchId,
        error: &str,
    ) -> Result<SyncStatus, StoreError> {
        let mut state = self.lock()?;
        let previous = state.tables.sync_status.get(&branch_id);
        let status = SyncStatus {
            branch_id,
            last_sync: previous.and_then(|status| status.last_sync.clone()),
            sync_count: previous.map_or(0, |status| status.sync_count),
            last_error: Some(error.to_string()),
            updated_at: now_timestamp(),
        };
        state.commit(PersistedRecord::SyncStatus(status.clone()))?;
        state.checkpoint_if_due();
        Ok(status)
    }

    fn enqueue_quarantined(&self, record: NewQuarantinedEvent) -> Result<Option<u64>, StoreError> {
        let mut state = self.lock()?;
        if let Some(key) = queue_key(&record.event_id)
            && state.tables.queued_event_ids.contains_key(key)
        {
            return Ok(None);
        }
        let queue_id = state.tables.allocate_queue_id();
        let row = QuarantinedEvent::from_new(queue_id, record, now_timestamp());
        state.commit(PersistedRecord::Queued(row))?;
        state.checkpoint_if_due();
        Ok(Some(queue_id))
    }

    fn pending_quarantined(&self, max_rows: usize) -> Result<Vec<QuarantinedEvent>, StoreError> {
        let state = self.lock()?;
        Ok(state.tables.queue.values().take(max_rows).cloned().collect())
    }

    fn promote_quarantined(
        &self,
        queue_id: u64,
        event: NewAttendanceEvent,
    ) -> Result<PromotionOutcome, StoreError> {
        validate_event(&event)?;
        let mut state = self.lock()?;
        if !state.tables.queue.contains_key(&queue_id) {
            return Ok(PromotionOutcome::AlreadyRemoved);
        }
        let outcome = if state.tables.events.contains_key(&event.event_id) {
            PromotionOutcome::Duplicate
        } else {
            let row = AttendanceEvent::from_new(event, now_timestamp());
            state.commit(PersistedRecord::Event(row))?;
            PromotionOutcome::Inserted
        };
        // Event first: a crash in between leaves a row whose retry is a duplicate.
        state.commit(PersistedRecord::Dequeued { queue_id })?;
        state.checkpoint_if_due();
        Ok(outcome)
    }

    fn dead_letter_quarantined(&self, queue_id: u64, reason: &str) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let Some(record) = state.tables.queue.get(&queue_id).cloned() else {
            return Ok(false);
        };
        state.commit(PersistedRecord::DeadLettered(DeadLetteredEvent {
            record,
            reason: reason.to_string(),
            dead_lettered_at: now_timestamp(),
        }))?;
        state.checkpoint_if_due();
        Ok(true)
    }

    fn branch(&self, branch_id: BranchId) -> Result<Option<Branch>, StoreError> {
        Ok(self.lock()?.tables.branches.get(&branch_id).cloned())
    }

    fn event(&self, event_id: &str) -> Result<Option<AttendanceEvent>, StoreError> {
        Ok(self.lock()?.tables.events.get(event_id).cloned())
    }

    fn employee(
        &self,
        branch_id: BranchId,
        employee_id: &str,
    ) -> Result<Option<Employee>, StoreError> {
        Ok(self
            .lock()?
            .tables
            .employees
            .get(&(branch_id, employee_id.to_string()))
            .cloned())
    }

    fn sync_status(&self, branch_id: BranchId) -> Result<Option<SyncStatus>, StoreError> {
        Ok(self.lock()?.tables.sync_status.get(&branch_id).cloned())
    }

    fn events_len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.tables.events.len())
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetteredEvent>, StoreError> {
        Ok(self.lock()?.tables.dead_letters.clone())
    }

    fn queue_depth(&self) -> Result<QueueDepth, StoreError> {
        let state = self.lock()?;
        Ok(QueueDepth {
            pending_attendance: state.tables.queue.len(),
            dead_lettered: state.tables.dead_letters.len(),
        })
    }

    fn attendance_stats(&self, today: NaiveDate) -> Result<AttendanceStats, StoreError> {
        let state = self.lock()?;
        let events = &state.tables.events;
        let total_branches = events
            .values()
            .map(|event| event.branch_id)
            .collect::<BTreeSet<_>>()
            .len();
        let today_records = events
            .values()
            .filter(|event| calendar_date(&event.check_time) == Some(today))
            .count();
        let unsynced_records = events
            .values()
            .filter(|event| !event.synced_to_downstream)
            .count();
        let latest_record = events.values().map(|event| &event.check_time).max().cloned();
        let earliest_record = events.values().map(|event| &event.check_time).min().cloned();
        Ok(AttendanceStats {
            total_branches,
            total_records: events.len(),
            today_records,
            unsynced_records,
            latest_record,
            earliest_record,
        })
    }

    fn branch_overview(&self) -> Result<Vec<BranchOverview>, StoreError> {
        let state = self.lock()?;
        let mut event_counts: HashMap<BranchId, usize> = HashMap::new();
        for event in state.tables.events.values() {
            *event_counts.entry(event.branch_id).or_default() += 1;
        }
        Ok(state
            .tables
            .branches
            .values()
            .map(|branch| {
                let status = state.tables.sync_status.get(&branch.branch_id);
                BranchOverview {
                    branch_id: branch.branch_id,
                    branch_name: branch.branch_name.clone(),
                    is_active: branch.is_active,
                    created_at: branch.created_at.clone(),
                    last_sync: status.and_then(|status| status.last_sync.clone()),
                    sync_count: status.map_or(0, |status| status.sync_count),
                    last_error: status.and_then(|status| status.last_error.clone()),
                    event_count: event_counts.get(&branch.branch_id).copied().unwrap_or(0),
                }
            })
            .collect())
    }
}
