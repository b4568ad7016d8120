//! Shared HTTP-to-taxonomy error mapping for the wire adapters.

use reqwest::StatusCode;
use steward_core::ProviderError;

/// Map a non-success HTTP status to the engine's error taxonomy.
pub(crate) fn classify_status(
    status: StatusCode,
    retry_after_seconds: Option<u64>,
    body: &str,
) -> ProviderError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after_seconds },
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
            ProviderError::InvalidRequest(detail)
        }
        status if status.is_server_error() => ProviderError::Unavailable(detail),
        _ => ProviderError::Transient(detail),
    }
}

/// Map a transport-level failure to the taxonomy.
pub(crate) fn classify_transport(error: &reqwest::Error, timeout_ms: u64) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout(timeout_ms)
    } else if error.is_connect() {
        ProviderError::Unavailable(error.to_string())
    } else {
        ProviderError::Transient(error.to_string())
    }
}

pub(crate) fn retry_after_seconds(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_map_to_auth_errors() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            assert!(matches!(classify_status(status, None, ""), ProviderError::Auth(_)));
        }
    }

    #[test]
    fn rate_limit_status_carries_retry_after() {
        let error = classify_status(StatusCode::TOO_MANY_REQUESTS, Some(12), "");
        assert_eq!(error, ProviderError::RateLimited { retry_after_seconds: Some(12) });
    }

    #[test]
    fn client_errors_map_to_invalid_request() {
        let error = classify_status(StatusCode::BAD_REQUEST, None, "missing field `model`");
        assert!(matches!(error, ProviderError::InvalidRequest(detail) if detail.contains("model")));
    }

    #[test]
    fn server_errors_map_to_unavailable() {
        for status in
            [StatusCode::INTERNAL_SERVER_ERROR, StatusCode::BAD_GATEWAY, StatusCode::SERVICE_UNAVAILABLE]
        {
            assert!(matches!(classify_status(status, None, ""), ProviderError::Unavailable(_)));
        }
    }

    #[test]
    fn unexpected_statuses_fall_back_to_transient() {
        assert!(matches!(
            classify_status(StatusCode::IM_A_TEAPOT, None, ""),
            ProviderError::Transient(_)
        ));
    }
}
