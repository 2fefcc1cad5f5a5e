pub mod api;
pub mod promotion;
pub mod quarantine;
pub mod records;
pub mod transport;
pub mod transport_axum;

use schema::{BranchId, SyncStatus, ValidationError, default_branch_label};
use store::{BranchName, DedupStore, InsertOutcome, StoreError};
use tracing::{debug, error, warn};

pub use api::{BranchBatch, DevicePush, EmployeeRecord, PromotionRequest};
pub use promotion::{PromotionReport, promote_pending};
pub use quarantine::{QueueReport, accept_device_push};
use records::attendance_log_event;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    /// Structural problem with the request itself; nothing was written.
    #[error("{0}")]
    Rejected(String),
    #[error("storage failure: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted { event_id: String },
    Duplicate { event_id: String },
    Skipped { reason: ValidationError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub branch_id: BranchId,
    pub outcomes: Vec<RecordOutcome>,
    pub sync_status: SyncStatus,
}

impl BatchReport {
    pub fn inserted(&self) -> usize {
        self.count(|outcome| matches!(outcome, RecordOutcome::Inserted { .. }))
    }

    pub fn duplicates(&self) -> usize {
        self.count(|outcome| matches!(outcome, RecordOutcome::Duplicate { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, RecordOutcome::Skipped { .. }))
    }

    fn count(&self, predicate: impl Fn(&RecordOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|outcome| predicate(outcome)).count()
    }
}

/// Merges a trusted branch batch into the canonical log.
///
/// Records are processed in list order. Malformed records are skipped and
/// logged; duplicates are absorbed. The branch's sync count is bumped once
/// the batch completes, whether or not anything new was inserted. A storage
/// failure stops the batch where it is and records the error on the
/// branch's sync status; records committed before it stay committed.
pub fn ingest_branch_batch(
    store: &dyn DedupStore,
    batch: BranchBatch,
) -> Result<BatchReport, IngestError> {
    let BranchBatch {
        branch_id,
        branch_name,
        access_token,
        attendance_logs,
        employees,
    } = batch;

    let branch_name = branch_name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| default_branch_label(branch_id));
    store
        .upsert_branch(
            branch_id,
            BranchName::Replace(branch_name),
            access_token.as_deref(),
        )
        .map_err(|err| abort_batch(store, branch_id, err))?;

    let mut outcomes = Vec::with_capacity(attendance_logs.len());
    for (index, log) in attendance_logs.iter().enumerate() {
        let event = match attendance_log_event(branch_id, log) {
            Ok(event) => event,
            Err(reason) => {
                warn!(branch_id, index, %reason, "skipping attendance record");
                outcomes.push(RecordOutcome::Skipped { reason });
                continue;
            }
        };
        let event_id = event.event_id.clone();
        let employee_id = event.employee_id.clone();
        match store.insert_event_if_absent(event) {
            Ok(InsertOutcome::Inserted) => {
                if let Some(employee) = employees
                    .iter()
                    .find(|employee| employee.user_id == employee_id)
                {
                    store
                        .upsert_employee(
                            branch_id,
                            &employee.user_id,
                            &employee.name,
                            employee.card_number.as_deref(),
                        )
                        .map_err(|err| abort_batch(store, branch_id, err))?;
                }
                outcomes.push(RecordOutcome::Inserted { event_id });
            }
            Ok(InsertOutcome::Duplicate) => {
                debug!(branch_id, event_id = %event_id, "duplicate attendance event");
                outcomes.push(RecordOutcome::Duplicate { event_id });
            }
            Err(StoreError::Validation(reason)) => {
                warn!(branch_id, index, %reason, "skipping attendance record");
                outcomes.push(RecordOutcome::Skipped { reason });
            }
            Err(err) => return Err(abort_batch(store, branch_id, err)),
        }
    }

    let sync_status = store
        .record_sync_success(branch_id)
        .map_err(|err| abort_batch(store, branch_id, err))?;
    Ok(BatchReport {
        branch_id,
        outcomes,
        sync_status,
    })
}

fn abort_batch(store: &dyn DedupStore, branch_id: BranchId, err: StoreError) -> IngestError {
    error!(branch_id, error = %err, "trusted batch aborted by storage failure");
    if let Err(sync_err) = store.record_sync_failure(branch_id, &err.to_string()) {
        warn!(branch_id, error = %sync_err, "could not record sync failure");
    }
    IngestError::Store(err)
}
