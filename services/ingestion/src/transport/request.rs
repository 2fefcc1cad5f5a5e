use std::{collections::HashMap, str::FromStr};

use super::{HttpRequest, HttpResponse};

pub(super) fn split_target(target: &str) -> (String, HashMap<String, String>) {
    let (path, query_str) = target
        .split_once('?')
        .map(|(path, query)| (path, Some(query)))
        .unwrap_or((target, None));
    let mut query = HashMap::new();
    if let Some(query_str) = query_str {
        for pair in query_str.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            query.insert(k.to_string(), v.to_string());
        }
    }
    (path.to_string(), query)
}

/// Absent or empty values are `None`; anything unparsable is an error.
pub(super) fn parse_query_value<T: FromStr>(
    query: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, String> {
    match query.get(key).map(|value| value.trim()) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("query parameter '{key}' must be an integer")),
    }
}

/// Checks content type and UTF-8 of a POST body.
pub(super) fn json_body<'a>(
    request: &'a HttpRequest,
    route: &str,
) -> Result<&'a str, HttpResponse> {
    if let Some(content_type) = request.headers.get("content-type")
        && !content_type
            .to_ascii_lowercase()
            .contains("application/json")
    {
        return Err(HttpResponse::bad_request(&format!(
            "content-type must include application/json for {route}"
        )));
    }
    std::str::from_utf8(&request.body)
        .map_err(|_| HttpResponse::bad_request("request body must be valid UTF-8"))
}
