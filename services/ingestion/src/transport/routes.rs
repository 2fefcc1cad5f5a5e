use std::collections::HashMap;

use schema::{BranchId, now_timestamp, today_utc};
use tracing::warn;

use super::{
    AttendanceRuntime, HttpRequest, HttpResponse,
    authz::{AuthDecision, authorize_trusted, presented_bearer_token},
    payload::{parse_branch_batch, parse_device_push},
    persistence::map_ingest_error,
    request::{json_body, parse_query_value, split_target},
};
use crate::{
    IngestError,
    api::{
        BranchPushResponse, BranchesResponse, DevicePushResponse, PromotionRequest,
        PromotionResponse, QueueDepthResponse,
    },
};

const BRANCH_PUSH_PATH: &str = "/api/v1/attendance/push";
const DEVICE_PUSH_PATH: &str = "/api/v1/adms/push";
const PROMOTE_PATH: &str = "/api/v1/adms/promote";
const QUEUE_PATH: &str = "/api/v1/adms/queue";
const STATS_PATH: &str = "/api/v1/stats";
const BRANCHES_PATH: &str = "/api/v1/branches";

pub fn handle_request(runtime: &AttendanceRuntime, request: &HttpRequest) -> HttpResponse {
    let (path, query) = split_target(&request.target);
    match (request.method.as_str(), path.as_str()) {
        ("GET", "/health") => HttpResponse::ok_json("{\"status\":\"ok\"}".to_string()),
        ("GET", "/metrics") => HttpResponse::ok_text(runtime.metrics_text()),
        ("POST", BRANCH_PUSH_PATH) => handle_branch_push(runtime, request),
        ("POST", DEVICE_PUSH_PATH) => handle_device_push(runtime, request),
        ("POST", PROMOTE_PATH) => handle_promote(runtime, request, &query),
        ("GET", QUEUE_PATH) => match runtime.store().queue_depth() {
            Ok(depth) => HttpResponse::json(&QueueDepthResponse {
                pending_attendance: depth.pending_attendance,
                dead_lettered: depth.dead_lettered,
                timestamp: now_timestamp(),
            }),
            Err(err) => error_response(&IngestError::Store(err)),
        },
        ("GET", STATS_PATH) => match runtime.store().attendance_stats(today_utc()) {
            Ok(stats) => HttpResponse::json(&stats),
            Err(err) => error_response(&IngestError::Store(err)),
        },
        ("GET", BRANCHES_PATH) => match runtime.store().branch_overview() {
            Ok(branches) => HttpResponse::json(&BranchesResponse { branches }),
            Err(err) => error_response(&IngestError::Store(err)),
        },
        (_, BRANCH_PUSH_PATH) | (_, DEVICE_PUSH_PATH) | (_, PROMOTE_PATH) => {
            HttpResponse::method_not_allowed("only POST is supported")
        }
        (_, "/health") | (_, "/metrics") | (_, QUEUE_PATH) | (_, STATS_PATH)
        | (_, BRANCHES_PATH) => HttpResponse::method_not_allowed("only GET is supported"),
        _ => HttpResponse::not_found("unknown path"),
    }
}

fn handle_branch_push(runtime: &AttendanceRuntime, request: &HttpRequest) -> HttpResponse {
    if let Err(response) = authorize(runtime, request) {
        return response;
    }
    let body = match json_body(request, "POST /api/v1/attendance/push") {
        Ok(body) => body,
        Err(response) => {
            runtime.observe_rejected_branch_batch();
            return response;
        }
    };
    let batch = match parse_branch_batch(body, presented_bearer_token(request)) {
        Ok(batch) => batch,
        Err(message) => {
            warn!(reason = %message, "trusted batch rejected");
            runtime.observe_rejected_branch_batch();
            return HttpResponse::bad_request(&message);
        }
    };
    match runtime.push_branch_batch(batch) {
        Ok(report) => HttpResponse::json(&BranchPushResponse {
            status: "success",
            branch_id: report.branch_id,
            records_processed: report.inserted(),
            timestamp: now_timestamp(),
        }),
        Err(err) => error_response(&err),
    }
}

fn handle_device_push(runtime: &AttendanceRuntime, request: &HttpRequest) -> HttpResponse {
    let body = match json_body(request, "POST /api/v1/adms/push") {
        Ok(body) => body,
        Err(response) => {
            runtime.observe_rejected_device_push();
            return response;
        }
    };
    let push = match parse_device_push(body) {
        Ok(push) => push,
        Err(message) => {
            runtime.observe_rejected_device_push();
            return HttpResponse::bad_request(&message);
        }
    };
    match runtime.push_device_records(push) {
        Ok(report) => HttpResponse::json(&DevicePushResponse {
            status: "success",
            records_queued: report.records_queued,
        }),
        Err(err) => error_response(&err),
    }
}

fn handle_promote(
    runtime: &AttendanceRuntime,
    request: &HttpRequest,
    query: &HashMap<String, String>,
) -> HttpResponse {
    if let Err(response) = authorize(runtime, request) {
        return response;
    }
    let max_rows = match parse_query_value::<usize>(query, "max_rows") {
        Ok(value) => value.unwrap_or(0),
        Err(err) => return HttpResponse::bad_request(&err),
    };
    let branch_override = match parse_query_value::<BranchId>(query, "branch_id") {
        Ok(value) => value,
        Err(err) => return HttpResponse::bad_request(&err),
    };
    match runtime.run_promotion(PromotionRequest {
        max_rows,
        branch_override,
    }) {
        Ok(report) => HttpResponse::json(&PromotionResponse {
            status: "success",
            moved: report.inserted,
        }),
        Err(err) => error_response(&err),
    }
}

fn authorize(runtime: &AttendanceRuntime, request: &HttpRequest) -> Result<(), HttpResponse> {
    match authorize_trusted(request, runtime.auth_policy()) {
        AuthDecision::Allowed => Ok(()),
        AuthDecision::Unauthorized(reason) => {
            runtime.observe_auth_failure();
            Err(HttpResponse::unauthorized(reason))
        }
    }
}

fn error_response(err: &IngestError) -> HttpResponse {
    let (status, message) = map_ingest_error(err);
    HttpResponse::error_with_status(status, &message)
}
