use std::collections::HashSet;

use super::HttpRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum AuthDecision {
    Allowed,
    Unauthorized(&'static str),
}

/// Shared-key gate for the trusted endpoints. An empty key set leaves them
/// open.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthPolicy {
    api_keys: HashSet<String>,
}

impl AuthPolicy {
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            api_keys: keys
                .into_iter()
                .map(|key| key.as_ref().trim().to_string())
                .filter(|key| !key.is_empty())
                .collect(),
        }
    }

    pub fn from_csv(raw: Option<&str>) -> Self {
        Self::from_keys(raw.unwrap_or_default().split(','))
    }

    pub fn is_open(&self) -> bool {
        self.api_keys.is_empty()
    }
}

pub(super) fn authorize_trusted(request: &HttpRequest, policy: &AuthPolicy) -> AuthDecision {
    if policy.is_open() {
        return AuthDecision::Allowed;
    }
    match presented_api_key(request) {
        Some(key) if policy.api_keys.contains(key) => AuthDecision::Allowed,
        _ => AuthDecision::Unauthorized("missing or invalid API key"),
    }
}

fn presented_api_key(request: &HttpRequest) -> Option<&str> {
    if let Some(value) = request.headers.get("x-api-key") {
        return Some(value.trim());
    }
    presented_bearer_token(request)
}

pub(super) fn presented_bearer_token(request: &HttpRequest) -> Option<&str> {
    let value = request.headers.get("authorization")?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
