//! Opaque HTTP pass-through for `?target=<url>` requests.
//!
//! Not MCP-aware: the method, body and content headers are relayed as-is and
//! the upstream response body is streamed back. Enabled by `--enable-proxy`.

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};

/// Headers copied toward the target; hop-by-hop and host headers stay behind.
const FORWARDED_REQUEST_HEADERS: &[header::HeaderName] = &[
    header::ACCEPT,
    header::ACCEPT_ENCODING,
    header::AUTHORIZATION,
    header::CONTENT_TYPE,
    header::USER_AGENT,
];

pub async fn forward(
    http: &reqwest::Client,
    target: &str,
    request: Request<Body>,
    max_body_bytes: usize,
) -> Response {
    let url = match reqwest::Url::parse(target) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => url,
        Ok(url) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("unsupported target scheme: {}", url.scheme()),
            )
                .into_response();
        }
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid target url: {e}")).into_response();
        }
    };

    let method = match reqwest::Method::from_bytes(request.method().as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("failed to read request body: {e}"),
            )
                .into_response();
        }
    };

    let mut outbound = http.request(method, url.clone());
    for name in FORWARDED_REQUEST_HEADERS {
        if let Some(value) = parts.headers.get(name) {
            outbound = outbound.header(name, value);
        }
    }
    if !body.is_empty() {
        outbound = outbound.body(body);
    }

    let upstream = match outbound.send().await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(target = %url, error = %e, "pass-through request failed");
            return (
                StatusCode::BAD_GATEWAY,
                format!("pass-through request failed: {e}"),
            )
                .into_response();
        }
    };

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| HeaderValue::from_bytes(v.as_bytes()).ok());

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
    }
    response
}
