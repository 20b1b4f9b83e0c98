//! Error surfaces: the admin JSON envelope and provider-shaped proxy errors.
//!
//! Refusals are not errors and never pass through these types; they travel
//! as ordinary 200 responses in the provider's native shape.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use archestra_core::StoreError;

use crate::upstream::UpstreamError;

/// Errors surfaced on the admin API with the `{error: {message, type}}`
/// envelope.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::RateLimited => "rate_limited",
            ApiError::Internal(_) => "api_error",
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::NotFound(what),
            StoreError::Conflict(what) => ApiError::Validation(what),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "admin API error");
        }
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Which provider surface a proxy error must be shaped for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAi,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
        }
    }
}

/// Errors on the proxy surface, shaped into the provider's native error
/// body before leaving the daemon.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("upstream returned {status}")]
    Upstream { status: u16, body: String },
    #[error("upstream deadline exceeded")]
    Timeout,
    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ProxyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ProxyError::NotFound(what),
            other => ProxyError::Internal(other.to_string()),
        }
    }
}

impl From<archestra_core::Error> for ProxyError {
    fn from(err: archestra_core::Error) -> Self {
        match err {
            archestra_core::Error::Store(store) => store.into(),
            other => ProxyError::Internal(other.to_string()),
        }
    }
}

impl From<UpstreamError> for ProxyError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Status { status, body } => ProxyError::Upstream { status, body },
            UpstreamError::Timeout => ProxyError::Timeout,
            other => ProxyError::Upstream {
                status: 502,
                body: other.to_string(),
            },
        }
    }
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Validation(_) => StatusCode::BAD_REQUEST,
            ProxyError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn provider_error_type(&self, provider: Provider) -> &'static str {
        match (provider, self) {
            (Provider::Anthropic, ProxyError::Validation(_)) => "invalid_request_error",
            (Provider::Anthropic, ProxyError::Unauthorized(_)) => "authentication_error",
            (Provider::Anthropic, ProxyError::NotFound(_)) => "not_found_error",
            (Provider::Anthropic, ProxyError::Timeout) => "timeout_error",
            (Provider::Anthropic, _) => "api_error",
            (Provider::OpenAi, ProxyError::Validation(_)) => "invalid_request_error",
            (Provider::OpenAi, ProxyError::Unauthorized(_)) => "authentication_error",
            (Provider::OpenAi, ProxyError::NotFound(_)) => "not_found_error",
            (Provider::OpenAi, ProxyError::Timeout) => "timeout_error",
            (Provider::OpenAi, _) => "server_error",
        }
    }

    /// Shape this error as the provider's native error body. Upstream error
    /// bodies that already parse as JSON pass through verbatim.
    pub fn into_provider_response(self, provider: Provider) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(provider = provider.as_str(), error = %self, "proxy error");
        }

        if let ProxyError::Upstream { ref body, .. } = self {
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(body) {
                return (status, Json(parsed)).into_response();
            }
        }

        let error_type = self.provider_error_type(provider);
        let body = match provider {
            Provider::Anthropic => json!({
                "type": "error",
                "error": { "type": error_type, "message": self.to_string() }
            }),
            Provider::OpenAi => json!({
                "error": {
                    "message": self.to_string(),
                    "type": error_type,
                    "code": null,
                }
            }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_envelope_types() {
        assert_eq!(
            ApiError::Validation("x".into()).error_type(),
            "validation_error"
        );
        assert_eq!(ApiError::NotFound("x".into()).error_type(), "not_found");
        assert_eq!(ApiError::RateLimited.error_type(), "rate_limited");
        assert_eq!(ApiError::Internal("x".into()).error_type(), "api_error");
    }

    #[test]
    fn store_errors_map_to_api_kinds() {
        let err: ApiError = StoreError::NotFound("limit lim-1".into()).into();
        assert!(matches!(err, ApiError::NotFound(_)));
        let err: ApiError = StoreError::Database("locked".into()).into();
        assert!(matches!(err, ApiError::Internal(_)));
    }

    #[test]
    fn proxy_status_mapping() {
        assert_eq!(
            ProxyError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ProxyError::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ProxyError::Upstream {
                status: 429,
                body: String::new()
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
