use schema::{
    BranchId, DEFAULT_PROMOTION_MAX_ROWS, NewAttendanceEvent, PROMOTED_BRANCH_NAME,
    PROMOTED_MACHINE_ID, QuarantinedEvent, ValidationError, resolve_queued_branch,
    validate_event,
};
use store::{BranchName, DedupStore, PromotionOutcome, StoreError};
use tracing::{debug, error, warn};

use crate::{IngestError, api::PromotionRequest};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PromotionReport {
    pub examined: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub dead_lettered: usize,
    /// Rows another run removed first.
    pub already_removed: usize,
    /// Rows whose branch upsert or promotion hit a storage error.
    pub failed: usize,
    pub synced_branch: Option<BranchId>,
}

pub fn effective_max_rows(requested: usize) -> usize {
    if requested == 0 {
        DEFAULT_PROMOTION_MAX_ROWS
    } else {
        requested
    }
}

/// Moves up to `max_rows` queued records into the canonical log, oldest
/// first. Every examined row leaves the queue: promoted, absorbed as a
/// duplicate, or dead-lettered with its reason. A storage error on one row
/// dead-letters that row and the run continues; the row stays queued only
/// if the dead-letter write fails as well. Sync success is recorded once,
/// for the last promoted record's branch, and only if something new was
/// inserted.
pub fn promote_pending(
    store: &dyn DedupStore,
    request: PromotionRequest,
) -> Result<PromotionReport, IngestError> {
    let pending = store.pending_quarantined(effective_max_rows(request.max_rows))?;
    let mut report = PromotionReport::default();
    let mut last_branch = None;

    for record in pending {
        report.examined += 1;
        let queue_id = record.queue_id;
        let event = match promotable_event(&record, request.branch_override) {
            Ok(event) => event,
            Err(reason) => {
                dead_letter(store, &mut report, queue_id, &reason.to_string());
                continue;
            }
        };

        let branch_id = event.branch_id;
        let outcome = store
            .upsert_branch(
                branch_id,
                BranchName::KeepOr(PROMOTED_BRANCH_NAME.to_string()),
                None,
            )
            .and_then(|_| store.promote_quarantined(queue_id, event));
        match outcome {
            Ok(PromotionOutcome::Inserted) => {
                report.inserted += 1;
                last_branch = Some(branch_id);
            }
            Ok(PromotionOutcome::Duplicate) => {
                debug!(queue_id, "queued record already canonical");
                report.duplicates += 1;
                last_branch = Some(branch_id);
            }
            Ok(PromotionOutcome::AlreadyRemoved) => report.already_removed += 1,
            Err(StoreError::Validation(reason)) => {
                dead_letter(store, &mut report, queue_id, &reason.to_string());
            }
            Err(err) => {
                error!(queue_id, branch_id, error = %err, "promotion of queued record failed");
                report.failed += 1;
                dead_letter(store, &mut report, queue_id, &err.to_string());
            }
        }
    }

    if report.inserted > 0
        && let Some(branch_id) = last_branch
    {
        store.record_sync_success(branch_id)?;
        report.synced_branch = Some(branch_id);
    }
    Ok(report)
}

fn promotable_event(
    record: &QuarantinedEvent,
    branch_override: Option<BranchId>,
) -> Result<NewAttendanceEvent, ValidationError> {
    let branch_id = resolve_queued_branch(&record.branch_id, branch_override)?;
    let event = NewAttendanceEvent {
        event_id: record.canonical_event_id(),
        branch_id,
        employee_id: record.employee_id.clone(),
        check_time: record.timestamp.clone(),
        punch_type: Some(record.punch_type),
        status: Some(record.status),
        machine_id: Some(PROMOTED_MACHINE_ID.to_string()),
    };
    validate_event(&event)?;
    Ok(event)
}

fn dead_letter(store: &dyn DedupStore, report: &mut PromotionReport, queue_id: u64, reason: &str) {
    warn!(queue_id, %reason, "dead-lettering quarantined record");
    match store.dead_letter_quarantined(queue_id, reason) {
        Ok(true) => report.dead_lettered += 1,
        Ok(false) => report.already_removed += 1,
        Err(err) => {
            error!(queue_id, error = %err, "dead-letter write failed; record stays queued");
        }
    }
}
