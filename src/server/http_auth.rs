use axum::http::{header, header::HeaderMap};
use uuid::Uuid;

/// Header carrying the authenticated account id, set by the front-end after login.
pub(super) const ACCOUNT_HEADER: &str = "x-account-id";

pub(super) fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
}

/// An empty expected token disables the check (local development).
pub(super) fn is_service_authorized(headers: &HeaderMap, expected_token: &str) -> bool {
    expected_token.is_empty() || extract_bearer_token(headers) == Some(expected_token)
}

pub(super) fn extract_account_id(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get(ACCOUNT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extract_bearer_token_happy_path() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(extract_bearer_token(&headers), Some("abc123"));
    }

    #[test]
    fn extract_bearer_token_rejects_missing_empty_or_wrong_scheme() {
        assert_eq!(extract_bearer_token(&HeaderMap::new()), None);

        let mut empty = HeaderMap::new();
        empty.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(extract_bearer_token(&empty), None);

        let mut basic = HeaderMap::new();
        basic.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc123"));
        assert_eq!(extract_bearer_token(&basic), None);
    }

    #[test]
    fn service_auth_requires_matching_token_when_configured() {
        let mut headers = HeaderMap::new();
        assert!(is_service_authorized(&headers, ""));
        assert!(!is_service_authorized(&headers, "secret"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
        assert!(!is_service_authorized(&headers, "secret"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert!(is_service_authorized(&headers, "secret"));
    }

    #[test]
    fn account_header_must_be_a_uuid() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_account_id(&headers), None);

        headers.insert(ACCOUNT_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert_eq!(extract_account_id(&headers), None);

        let id = Uuid::new_v4();
        headers.insert(
            ACCOUNT_HEADER,
            HeaderValue::from_str(&id.to_string()).unwrap(),
        );
        assert_eq!(extract_account_id(&headers), Some(id));
    }
}
