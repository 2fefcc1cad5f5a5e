use schema::BranchId;
use serde_json::{Map, Value};

use crate::{
    api::{BranchBatch, DevicePush, EmployeeRecord},
    records::json_text,
};

fn parse_object(body: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(_) => Err("request body must be a JSON object".to_string()),
        Err(err) => Err(format!("invalid JSON: {err}")),
    }
}

fn parse_branch_id(value: Option<&Value>) -> Result<BranchId, String> {
    let parsed = match value {
        Some(Value::Number(number)) => number.as_i64(),
        Some(Value::String(text)) => text.trim().parse::<BranchId>().ok(),
        _ => return Err("branch_id is required".to_string()),
    };
    parsed.ok_or_else(|| "branch_id must be an integer".to_string())
}

/// Structural validation of a trusted push. Per-record checks happen later.
pub(super) fn parse_branch_batch(
    body: &str,
    access_token: Option<&str>,
) -> Result<BranchBatch, String> {
    let fields = parse_object(body)?;
    let branch_id = parse_branch_id(fields.get("branch_id"))?;
    let branch_name = match fields.get("branch_name") {
        None => return Err("branch_name is required".to_string()),
        Some(Value::Null) => None,
        Some(Value::String(name)) => Some(name.clone()),
        Some(_) => return Err("branch_name must be a string".to_string()),
    };
    let Some(data) = fields.get("data").and_then(Value::as_object) else {
        return Err("data must be an object".to_string());
    };
    let Some(attendance_logs) = data.get("attendance_logs").and_then(Value::as_array) else {
        return Err("data.attendance_logs must be an array".to_string());
    };
    let employees = match data.get("employees") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries.iter().filter_map(employee_record).collect(),
        Some(_) => return Err("data.employees must be an array".to_string()),
    };
    Ok(BranchBatch {
        branch_id,
        branch_name,
        access_token: access_token.map(str::to_string),
        attendance_logs: attendance_logs.clone(),
        employees,
    })
}

fn employee_record(entry: &Value) -> Option<EmployeeRecord> {
    let fields = entry.as_object()?;
    let user_id = json_text(fields.get("user_id")).filter(|id| !id.trim().is_empty())?;
    Some(EmployeeRecord {
        user_id,
        name: json_text(fields.get("name")).unwrap_or_default(),
        card_number: json_text(fields.get("card_number")),
    })
}

/// Only the envelope is checked here; `event_type` is judged by the
/// quarantine pipeline.
pub(super) fn parse_device_push(body: &str) -> Result<DevicePush, String> {
    let fields = parse_object(body)?;
    let records = match fields.get("data") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(records)) => records.clone(),
        Some(_) => return Err("data must be an array".to_string()),
    };
    Ok(DevicePush {
        event_type: fields
            .get("event_type")
            .and_then(Value::as_str)
            .map(str::to_string),
        branch_id: json_text(fields.get("branch_id")).unwrap_or_default(),
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_branch_batch_accepts_contract_payload() {
        let body = r#"{
            "branch_id": "4",
            "branch_name": "Harbour",
            "data": {
                "attendance_logs": [
                    {"event_id": "e1", "user_id": "42", "timestamp": "2024-01-01 09:00:00"}
                ],
                "employees": [
                    {"user_id": 42, "name": "Ann", "card_number": "C-1"},
                    {"name": "missing id"}
                ]
            }
        }"#;
        let batch = parse_branch_batch(body, Some("tok")).unwrap();
        assert_eq!(batch.branch_id, 4);
        assert_eq!(batch.branch_name.as_deref(), Some("Harbour"));
        assert_eq!(batch.access_token.as_deref(), Some("tok"));
        assert_eq!(batch.attendance_logs.len(), 1);
        assert_eq!(
            batch.employees,
            vec![EmployeeRecord {
                user_id: "42".to_string(),
                name: "Ann".to_string(),
                card_number: Some("C-1".to_string()),
            }]
        );
    }

    #[test]
    fn parse_branch_batch_requires_structural_fields() {
        let cases = [
            (r#"{"branch_name":"HQ","data":{"attendance_logs":[]}}"#, "branch_id is required"),
            (
                r#"{"branch_id":"x","branch_name":"HQ","data":{"attendance_logs":[]}}"#,
                "branch_id must be an integer",
            ),
            (r#"{"branch_id":1,"data":{"attendance_logs":[]}}"#, "branch_name is required"),
            (r#"{"branch_id":1,"branch_name":"HQ"}"#, "data must be an object"),
            (
                r#"{"branch_id":1,"branch_name":"HQ","data":{"attendance_logs":{}}}"#,
                "data.attendance_logs must be an array",
            ),
            ("[1,2]", "request body must be a JSON object"),
        ];
        for (body, expected) in cases {
            assert_eq!(parse_branch_batch(body, None).unwrap_err(), expected);
        }
    }

    #[test]
    fn parse_branch_batch_treats_null_name_as_unnamed() {
        let batch = parse_branch_batch(
            r#"{"branch_id":1,"branch_name":null,"data":{"attendance_logs":[]}}"#,
            None,
        )
        .unwrap();
        assert_eq!(batch.branch_name, None);
    }

    #[test]
    fn parse_device_push_keeps_branch_as_raw_text() {
        let push = parse_device_push(
            r#"{"event_type":"attendance","branch_id":12,"data":[{"user_id":"1"}]}"#,
        )
        .unwrap();
        assert_eq!(push.event_type.as_deref(), Some("attendance"));
        assert_eq!(push.branch_id, "12");
        assert_eq!(push.records.len(), 1);

        let push = parse_device_push(r#"{"event_type":"attendance"}"#).unwrap();
        assert_eq!(push.branch_id, "");
        assert!(push.records.is_empty());

        assert!(parse_device_push(r#"{"event_type":"attendance","data":{}}"#).is_err());
        assert!(parse_device_push("not json").unwrap_err().starts_with("invalid JSON"));
    }
}
