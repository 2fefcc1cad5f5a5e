use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use store::{DedupStore, StoreError};
use tracing::{info, warn};

use crate::{
    BatchReport, IngestError, ingest_branch_batch,
    api::{BranchBatch, DevicePush, PromotionRequest},
    promotion::{PromotionReport, promote_pending},
    quarantine::{QueueReport, accept_device_push},
};

mod authz;
mod config;
mod http;
mod payload;
mod persistence;
mod request;
mod routes;


pub use authz::AuthPolicy;
pub use config::ServiceConfig;
pub use http::{HttpRequest, HttpResponse};
pub use routes::handle_request;

pub(crate) const MAX_HTTP_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Default)]
struct RuntimeMetrics {
    trusted_batches_accepted: AtomicU64,
    trusted_batches_rejected: AtomicU64,
    events_inserted: AtomicU64,
    events_duplicate: AtomicU64,
    events_skipped: AtomicU64,
    device_pushes_accepted: AtomicU64,
    device_pushes_rejected: AtomicU64,
    records_queued: AtomicU64,
    promotion_runs: AtomicU64,
    records_promoted: AtomicU64,
    records_dead_lettered: AtomicU64,
    storage_failures: AtomicU64,
    auth_failures: AtomicU64,
}

fn bump(counter: &AtomicU64, by: usize) {
    counter.fetch_add(by as u64, Ordering::Relaxed);
}

/// Everything a request handler needs. Shared by reference across workers;
/// the store synchronizes itself and counters are atomics.
pub struct AttendanceRuntime {
    store: Arc<dyn DedupStore>,
    auth: AuthPolicy,
    metrics: RuntimeMetrics,
    started_at: Instant,
}

pub type SharedRuntime = Arc<AttendanceRuntime>;

impl AttendanceRuntime {
    pub fn new(store: Arc<dyn DedupStore>) -> Self {
        Self {
            store,
            auth: AuthPolicy::default(),
            metrics: RuntimeMetrics::default(),
            started_at: Instant::now(),
        }
    }

    pub fn with_auth_policy(mut self, auth: AuthPolicy) -> Self {
        self.auth = auth;
        self
    }

    pub fn store(&self) -> &dyn DedupStore {
        self.store.as_ref()
    }

    pub(crate) fn auth_policy(&self) -> &AuthPolicy {
        &self.auth
    }

    pub fn push_branch_batch(&self, batch: BranchBatch) -> Result<BatchReport, IngestError> {
        let branch_id = batch.branch_id;
        match ingest_branch_batch(self.store(), batch) {
            Ok(report) => {
                bump(&self.metrics.trusted_batches_accepted, 1);
                bump(&self.metrics.events_inserted, report.inserted());
                bump(&self.metrics.events_duplicate, report.duplicates());
                bump(&self.metrics.events_skipped, report.skipped());
                info!(
                    branch_id,
                    inserted = report.inserted(),
                    duplicates = report.duplicates(),
                    skipped = report.skipped(),
                    "trusted batch merged"
                );
                Ok(report)
            }
            Err(err) => {
                self.observe_failure(&err);
                bump(&self.metrics.trusted_batches_rejected, 1);
                Err(err)
            }
        }
    }

    pub fn push_device_records(&self, push: DevicePush) -> Result<QueueReport, IngestError> {
        match accept_device_push(self.store(), push) {
            Ok(report) => {
                bump(&self.metrics.device_pushes_accepted, 1);
                bump(&self.metrics.records_queued, report.records_queued);
                Ok(report)
            }
            Err(err) => {
                self.observe_failure(&err);
                bump(&self.metrics.device_pushes_rejected, 1);
                Err(err)
            }
        }
    }

    pub fn run_promotion(&self, request: PromotionRequest) -> Result<PromotionReport, IngestError> {
        bump(&self.metrics.promotion_runs, 1);
        let result = promote_pending(self.store(), request);
        match &result {
            Ok(report) => {
                bump(&self.metrics.records_promoted, report.inserted);
                bump(&self.metrics.records_dead_lettered, report.dead_lettered);
                bump(&self.metrics.storage_failures, report.failed);
                if report.examined > 0 {
                    info!(
                        examined = report.examined,
                        inserted = report.inserted,
                        duplicates = report.duplicates,
                        dead_lettered = report.dead_lettered,
                        failed = report.failed,
                        "promotion run finished"
                    );
                }
            }
            Err(err) => self.observe_failure(err),
        }
        result
    }

    pub(crate) fn observe_rejected_branch_batch(&self) {
        bump(&self.metrics.trusted_batches_rejected, 1);
    }

    pub(crate) fn observe_rejected_device_push(&self) {
        bump(&self.metrics.device_pushes_rejected, 1);
    }

    pub(crate) fn observe_auth_failure(&self) {
        bump(&self.metrics.auth_failures, 1);
    }

    fn observe_failure(&self, err: &IngestError) {
        if let IngestError::Store(store_err) = err
            && !matches!(store_err, StoreError::Validation(_))
        {
            bump(&self.metrics.storage_failures, 1);
        } else {
            warn!(error = %err, "request rejected");
        }
    }

    pub fn metrics_text(&self) -> String {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let m = &self.metrics;
        let events_total = self.store.events_len().unwrap_or(0);
        let (pending, dead_lettered) = self
            .store
            .queue_depth()
            .map(|depth| (depth.pending_attendance, depth.dead_lettered))
            .unwrap_or((0, 0));
        format!(
            "# TYPE punchhub_trusted_batches_accepted_total counter\n\
punchhub_trusted_batches_accepted_total {}\n\
# TYPE punchhub_trusted_batches_rejected_total counter\n\
punchhub_trusted_batches_rejected_total {}\n\
# TYPE punchhub_events_inserted_total counter\n\
punchhub_events_inserted_total {}\n\
# TYPE punchhub_events_duplicate_total counter\n\
punchhub_events_duplicate_total {}\n\
# TYPE punchhub_events_skipped_total counter\n\
punchhub_events_skipped_total {}\n\
# TYPE punchhub_device_pushes_accepted_total counter\n\
punchhub_device_pushes_accepted_total {}\n\
# TYPE punchhub_device_pushes_rejected_total counter\n\
punchhub_device_pushes_rejected_total {}\n\
# TYPE punchhub_records_queued_total counter\n\
punchhub_records_queued_total {}\n\
# TYPE punchhub_promotion_runs_total counter\n\
punchhub_promotion_runs_total {}\n\
# TYPE punchhub_records_promoted_total counter\n\
punchhub_records_promoted_total {}\n\
# TYPE punchhub_records_dead_lettered_total counter\n\
punchhub_records_dead_lettered_total {}\n\
# TYPE punchhub_storage_failures_total counter\n\
punchhub_storage_failures_total {}\n\
# TYPE punchhub_auth_failures_total counter\n\
punchhub_auth_failures_total {}\n\
# TYPE punchhub_events gauge\n\
punchhub_events {}\n\
# TYPE punchhub_queue_pending gauge\n\
punchhub_queue_pending {}\n\
# TYPE punchhub_queue_dead_lettered gauge\n\
punchhub_queue_dead_lettered {}\n\
# TYPE punchhub_uptime_seconds gauge\n\
punchhub_uptime_seconds {:.4}\n",
            load(&m.trusted_batches_accepted),
            load(&m.trusted_batches_rejected),
            load(&m.events_inserted),
            load(&m.events_duplicate),
            load(&m.events_skipped),
            load(&m.device_pushes_accepted),
            load(&m.device_pushes_rejected),
            load(&m.records_queued),
            load(&m.promotion_runs),
            load(&m.records_promoted),
            load(&m.records_dead_lettered),
            load(&m.storage_failures),
            load(&m.auth_failures),
            events_total,
            pending,
            dead_lettered,
            self.started_at.elapsed().as_secs_f64()
        )
    }
}
