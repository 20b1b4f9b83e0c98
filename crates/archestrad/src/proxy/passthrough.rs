//! Transparent reverse proxy for non-completion provider routes.
//!
//! Anything under `/v1/{provider}/` that is not a completion endpoint is
//! forwarded verbatim: method, body, query string, and auth headers
//! preserved; hop-by-hop headers stripped.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};

use crate::error::{Provider, ProxyError};
use crate::state::AppState;

/// Headers that never cross a proxy boundary.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// ANY /v1/:provider/*path
pub async fn forward(
    State(state): State<AppState>,
    Path((provider, rest)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let (provider_kind, base_url) = match provider.as_str() {
        "anthropic" => (
            Provider::Anthropic,
            state.config.providers.anthropic_base_url.clone(),
        ),
        "openai" => (
            Provider::OpenAi,
            state.config.providers.openai_base_url.clone(),
        ),
        other => {
            return ProxyError::NotFound(format!("unknown provider {other}"))
                .into_provider_response(Provider::Anthropic);
        }
    };

    match forward_inner(&state, &base_url, &rest, method, uri, headers, body).await {
        Ok(response) => response,
        Err(err) => err.into_provider_response(provider_kind),
    }
}

async fn forward_inner(
    state: &AppState,
    base_url: &str,
    rest: &str,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, ProxyError> {
    let mut url = format!("{}/{}", base_url.trim_end_matches('/'), rest);
    if let Some(query) = uri.query() {
        url.push('?');
        url.push_str(query);
    }

    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| ProxyError::Validation("unsupported method".to_string()))?;

    let mut request = state.passthrough.request(method, &url);
    for (name, value) in &headers {
        if !is_hop_by_hop(name.as_str()) {
            if let Ok(value) = value.to_str() {
                request = request.header(name.as_str(), value);
            }
        }
    }
    if !body.is_empty() {
        request = request.body(body.to_vec());
    }

    let upstream = request
        .send()
        .await
        .map_err(|err| ProxyError::Upstream {
            status: 502,
            body: err.to_string(),
        })?;

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name.as_str()) {
            if let (Ok(name), Ok(value)) = (
                axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
                axum::http::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                response_headers.insert(name, value);
            }
        }
    }

    let bytes = upstream
        .bytes()
        .await
        .map_err(|err| ProxyError::Upstream {
            status: 502,
            body: err.to_string(),
        })?;

    Ok((status, response_headers, Body::from(bytes)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(is_hop_by_hop("HOST"));
        assert!(!is_hop_by_hop("x-api-key"));
        assert!(!is_hop_by_hop("authorization"));
        assert!(!is_hop_by_hop("anthropic-version"));
    }
}
