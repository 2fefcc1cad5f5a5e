use schema::BranchId;
use serde::Serialize;
use serde_json::Value;
use store::BranchOverview;

/// A structurally valid trusted-path batch. Individual log entries are kept
/// raw so one malformed record cannot reject the whole batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchBatch {
    pub branch_id: BranchId,
    pub branch_name: Option<String>,
    pub access_token: Option<String>,
    pub attendance_logs: Vec<Value>,
    pub employees: Vec<EmployeeRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmployeeRecord {
    pub user_id: String,
    pub name: String,
    pub card_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DevicePush {
    pub event_type: Option<String>,
    /// Raw text; validated only at promotion.
    pub branch_id: String,
    pub records: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PromotionRequest {
    /// Zero selects the default batch size.
    pub max_rows: usize,
    pub branch_override: Option<BranchId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchPushResponse {
    pub status: &'static str,
    pub branch_id: BranchId,
    pub records_processed: usize,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DevicePushResponse {
    pub status: &'static str,
    pub records_queued: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromotionResponse {
    pub status: &'static str,
    pub moved: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueDepthResponse {
    pub pending_attendance: usize,
    pub dead_lettered: usize,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchesResponse {
    pub branches: Vec<BranchOverview>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
