//! Admission middleware that gates requests on the rate limiter.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{field, instrument, warn, Span};

use crate::ratelimit::{Clock, LimitResult, Limiter};

/// Header carrying the configured requests per window.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Header carrying the requests left in the current window.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Shared state for [`admission_middleware`].
#[derive(Clone)]
pub struct AdmissionState {
    limiter: Arc<Limiter>,
    clock: Arc<dyn Clock>,
    trust_forwarded_headers: bool,
}

impl AdmissionState {
    pub fn new(limiter: Arc<Limiter>, clock: Arc<dyn Clock>) -> Self {
        Self {
            limiter,
            clock,
            trust_forwarded_headers: false,
        }
    }

    /// Prefer `X-Forwarded-For` / `X-Real-IP` over the peer address.
    pub fn trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    pub fn limiter(&self) -> &Arc<Limiter> {
        &self.limiter
    }
}

/// Evaluate the caller against the limiter before running the rest of the
/// pipeline.
///
/// Denied requests get a 429 and store failures a 500; neither reaches the
/// downstream handler. Admitted responses carry the limit headers.
#[instrument(skip_all, fields(client_id = tracing::field::Empty))]
pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(client_id) = client_id(&request, state.trust_forwarded_headers) else {
        warn!("Could not determine client address");
        return system_error();
    };
    Span::current().record("client_id", field::display(&client_id));

    let now_ms = state.clock.now_ms();

    match state.limiter.evaluate(&client_id, now_ms).await {
        Err(_) => system_error(),
        Ok(result) if !result.admitted => too_many_requests(&result),
        Ok(result) => {
            let mut response = next.run(request).await;
            apply_limit_headers(response.headers_mut(), &result);
            response
        }
    }
}

fn apply_limit_headers(headers: &mut HeaderMap, result: &LimitResult) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(result.limit));
    headers.insert(
        X_RATELIMIT_REMAINING,
        HeaderValue::from(result.remaining),
    );
}

fn too_many_requests(result: &LimitResult) -> Response {
    let retry_after = result.retry_after_seconds().unwrap_or(1);

    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            (header::RETRY_AFTER, HeaderValue::from(retry_after)),
            (X_RATELIMIT_LIMIT, HeaderValue::from(result.limit)),
        ],
        Json(json!({
            "errors": [
                {
                    "message": "Too many requests",
                    "retryAfter": format!("{} sec", retry_after)
                }
            ]
        })),
    )
        .into_response()
}

fn system_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "errors": {
                "message": "System Error"
            }
        })),
    )
        .into_response()
}

/// Derive the per-caller key from the request.
fn client_id(request: &Request, trust_forwarded_headers: bool) -> Option<String> {
    if trust_forwarded_headers {
        if let Some(ip) = forwarded_ip(request.headers()) {
            return Some(ip.to_canonical().to_string());
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_canonical().to_string())
}

/// First address of `X-Forwarded-For`, falling back to `X-Real-IP`.
fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let forwarded_for = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse().ok());

    forwarded_for.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|ip| ip.trim().parse().ok())
    })
}
