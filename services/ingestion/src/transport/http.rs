use std::collections::HashMap;

use serde::Serialize;

use crate::api::ErrorResponse;

/// Transport-neutral request. Header names are lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: &str, target: &str) -> Self {
        Self {
            method: method.to_string(),
            target: target.to_string(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_json_body(self, body: &str) -> Self {
        let mut request = self.with_header("content-type", "application/json");
        request.body = body.as_bytes().to_vec();
        request
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl HttpResponse {
    pub(crate) fn ok_json(body: String) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body,
        }
    }

    pub(crate) fn ok_text(body: String) -> Self {
        Self {
            status: 200,
            content_type: "text/plain; version=0.0.4; charset=utf-8",
            body,
        }
    }

    pub(crate) fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self::ok_json(body),
            Err(err) => Self::internal_server_error(&format!("response encoding failed: {err}")),
        }
    }

    pub(crate) fn bad_request(message: &str) -> Self {
        Self::error_with_status(400, message)
    }

    pub(crate) fn unauthorized(message: &str) -> Self {
        Self::error_with_status(401, message)
    }

    pub(crate) fn not_found(message: &str) -> Self {
        Self::error_with_status(404, message)
    }

    pub(crate) fn method_not_allowed(message: &str) -> Self {
        Self::error_with_status(405, message)
    }

    pub(crate) fn internal_server_error(message: &str) -> Self {
        Self::error_with_status(500, message)
    }

    pub(crate) fn error_with_status(status: u16, message: &str) -> Self {
        let body = serde_json::to_string(&ErrorResponse {
            error: message.to_string(),
        })
        .unwrap_or_else(|_| "{\"error\":\"internal error\"}".to_string());
        Self {
            status,
            content_type: "application/json",
            body,
        }
    }
}
