//! HTTP integration: admission middleware and server.

mod interceptor;
mod server;

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};

pub use interceptor::{
    admission_middleware, AdmissionState, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
};
pub use server::HttpServer;

/// Minimal downstream routes for running the service standalone.
pub fn status_router() -> Router {
    Router::new().route("/", get(status))
}

async fn status() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
