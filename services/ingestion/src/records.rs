//! Coercion of loosely typed JSON records into the event shapes the store
//! accepts.

use schema::{
    BranchId, DEFAULT_PUNCH_TYPE, DEFAULT_STATUS, NewAttendanceEvent, NewQuarantinedEvent,
    ValidationError, validate_event,
};
use serde_json::Value;

/// Strings pass through, numbers become their decimal text.
pub(crate) fn json_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

pub(crate) fn json_small_int(
    value: Option<&Value>,
    field: &'static str,
) -> Result<Option<i16>, ValidationError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => number
            .as_i64()
            .and_then(|value| i16::try_from(value).ok())
            .map(Some)
            .ok_or(ValidationError::InvalidRange(field)),
        Some(Value::String(text)) => text
            .trim()
            .parse::<i16>()
            .map(Some)
            .map_err(|_| ValidationError::InvalidRange(field)),
        Some(_) => Err(ValidationError::InvalidRange(field)),
    }
}

/// One `attendance_logs` entry of a trusted batch.
pub fn attendance_log_event(
    branch_id: BranchId,
    log: &Value,
) -> Result<NewAttendanceEvent, ValidationError> {
    let fields = log.as_object().ok_or(ValidationError::NotAnObject)?;
    let event = NewAttendanceEvent {
        event_id: json_text(fields.get("event_id")).unwrap_or_default(),
        branch_id,
        employee_id: json_text(fields.get("user_id")).unwrap_or_default(),
        check_time: json_text(fields.get("timestamp")).unwrap_or_default(),
        punch_type: json_small_int(fields.get("punch_type"), "punch_type")?,
        status: json_small_int(fields.get("status"), "status")?,
        machine_id: json_text(fields.get("machine_id"))
            .filter(|machine_id| !machine_id.trim().is_empty()),
    };
    validate_event(&event)?;
    Ok(event)
}

/// One `data` entry of a device push. Nothing is validated beyond shape.
pub fn device_record(branch_id: &str, record: &Value) -> Option<NewQuarantinedEvent> {
    let fields = record.as_object()?;
    Some(NewQuarantinedEvent {
        event_id: json_text(fields.get("event_id")),
        branch_id: branch_id.to_string(),
        employee_id: json_text(fields.get("user_id")).unwrap_or_default(),
        timestamp: json_text(fields.get("timestamp")).unwrap_or_default(),
        punch_type: json_small_int(fields.get("punch_type"), "punch_type")
            .ok()
            .flatten()
            .unwrap_or(DEFAULT_PUNCH_TYPE),
        status: json_small_int(fields.get("status"), "status")
            .ok()
            .flatten()
            .unwrap_or(DEFAULT_STATUS),
    })
}
