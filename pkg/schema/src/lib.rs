use chrono::{NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Intake constants
// ---------------------------------------------------------------------------

/// Discriminator a raw device push must carry to be accepted.
pub const DEVICE_EVENT_TYPE: &str = "attendance";

/// Punch type substituted when a device record omits it.
pub const DEFAULT_PUNCH_TYPE: i16 = 1;

/// Status code substituted when a device record omits it.
pub const DEFAULT_STATUS: i16 = 1;

/// Machine identifier stamped on every event promoted out of quarantine.
pub const PROMOTED_MACHINE_ID: &str = "ADMS";

/// Display name given to a branch first seen through the promotion path.
pub const PROMOTED_BRANCH_NAME: &str = "ADMS Branch";

pub const DEFAULT_PROMOTION_MAX_ROWS: usize = 200;

pub type BranchId = i64;

// ---------------------------------------------------------------------------
// Registry tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub branch_id: BranchId,
    pub branch_name: String,
    pub access_token: String,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub branch_id: BranchId,
    pub employee_id: String,
    pub name: String,
    pub card_number: Option<String>,
    pub updated_at: String,
}

/// Per-branch ingestion bookkeeping. `sync_count` only ever grows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub branch_id: BranchId,
    pub last_sync: Option<String>,
    pub sync_count: u64,
    pub last_error: Option<String>,
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Canonical log
// ---------------------------------------------------------------------------

/// A punch event as submitted for insertion into the canonical log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAttendanceEvent {
    pub event_id: String,
    pub branch_id: BranchId,
    pub employee_id: String,
    /// Stored verbatim; readers must tolerate mixed formats.
    pub check_time: String,
    pub punch_type: Option<i16>,
    pub status: Option<i16>,
    pub machine_id: Option<String>,
}

/// A row of the canonical log. Created once, never overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub event_id: String,
    pub branch_id: BranchId,
    pub employee_id: String,
    pub check_time: String,
    pub punch_type: Option<i16>,
    pub status: Option<i16>,
    pub machine_id: Option<String>,
    /// Owned by the downstream sync consumer; always false at creation.
    pub synced_to_downstream: bool,
    pub created_at: String,
}

impl AttendanceEvent {
    pub fn from_new(event: NewAttendanceEvent, created_at: String) -> Self {
        Self {
            event_id: event.event_id,
            branch_id: event.branch_id,
            employee_id: event.employee_id,
            check_time: event.check_time,
            punch_type: event.punch_type,
            status: event.status,
            machine_id: event.machine_id,
            synced_to_downstream: false,
            created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Quarantine queue
// ---------------------------------------------------------------------------

/// A raw device record on its way into the queue. Nothing here is validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewQuarantinedEvent {
    pub event_id: Option<String>,
    pub branch_id: String,
    pub employee_id: String,
    pub timestamp: String,
    pub punch_type: i16,
    pub status: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantinedEvent {
    /// Monotonic, never reused; defines FIFO order.
    pub queue_id: u64,
    pub event_id: Option<String>,
    pub branch_id: String,
    pub employee_id: String,
    pub timestamp: String,
    pub punch_type: i16,
    pub status: i16,
    pub queued_at: String,
}

impl QuarantinedEvent {
    pub fn from_new(queue_id: u64, record: NewQuarantinedEvent, queued_at: String) -> Self {
        Self {
            queue_id,
            event_id: record.event_id,
            branch_id: record.branch_id,
            employee_id: record.employee_id,
            timestamp: record.timestamp,
            punch_type: record.punch_type,
            status: record.status,
            queued_at,
        }
    }

    /// The identifier the record will carry in the canonical log.
    /// Blank ids count as absent; anything else is kept verbatim, matching
    /// how the trusted path stores ids.
    pub fn canonical_event_id(&self) -> String {
        match self.event_id.as_deref() {
            Some(event_id) if !event_id.trim().is_empty() => event_id.to_string(),
            _ => synthesized_event_id(self.queue_id),
        }
    }
}

/// A queued record that could not be promoted, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetteredEvent {
    pub record: QuarantinedEvent,
    pub reason: String,
    pub dead_lettered_at: String,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("field out of range: {0}")]
    InvalidRange(&'static str),
    #[error("invalid branch identifier: {0:?}")]
    InvalidBranch(String),
    #[error("record is not a JSON object")]
    NotAnObject,
}

pub fn validate_event(event: &NewAttendanceEvent) -> Result<(), ValidationError> {
    if event.event_id.trim().is_empty() {
        return Err(ValidationError::MissingField("event_id"));
    }
    if event.employee_id.trim().is_empty() {
        return Err(ValidationError::MissingField("user_id"));
    }
    if event.check_time.trim().is_empty() {
        return Err(ValidationError::MissingField("timestamp"));
    }
    if let Some(machine_id) = &event.machine_id
        && machine_id.trim().is_empty()
    {
        return Err(ValidationError::MissingField("machine_id"));
    }
    Ok(())
}

/// Resolves the branch a queued record belongs to: the override wins, an
/// empty stored value means branch 0, anything else must be an integer.
pub fn resolve_queued_branch(
    stored: &str,
    override_branch: Option<BranchId>,
) -> Result<BranchId, ValidationError> {
    if let Some(branch_id) = override_branch {
        return Ok(branch_id);
    }
    let trimmed = stored.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed
        .parse::<BranchId>()
        .map_err(|_| ValidationError::InvalidBranch(trimmed.to_string()))
}

// ---------------------------------------------------------------------------
// Naming and time helpers
// ---------------------------------------------------------------------------

/// Label used when a trusted push names no branch.
pub fn default_branch_label(branch_id: BranchId) -> String {
    if branch_id == 1 {
        "Device 1".to_string()
    } else {
        format!("Branch {branch_id}")
    }
}

pub fn synthesized_event_id(queue_id: u64) -> String {
    format!("adms-{queue_id}")
}

/// Server-assigned timestamps: RFC 3339, UTC, second precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn today_utc() -> NaiveDate {
    Utc::now().date_naive()
}

/// Calendar date of an opaque timestamp string, when its first ten
/// characters hold a `YYYY-MM-DD` date.
pub fn calendar_date(timestamp: &str) -> Option<NaiveDate> {
    let head = timestamp.trim().get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}
