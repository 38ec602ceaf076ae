//! HTTP server that puts the admission middleware in front of a router.

use std::net::SocketAddr;

use axum::{middleware, Router};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::interceptor::{admission_middleware, AdmissionState};
use crate::error::Result;

/// HTTP server for an admission-controlled service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Admission state shared by every request
    state: AdmissionState,
    /// Downstream routes
    routes: Router,
}

impl HttpServer {
    /// Create a server that gates `routes` with the given admission state.
    pub fn new(addr: SocketAddr, state: AdmissionState, routes: Router) -> Self {
        Self {
            addr,
            state,
            routes,
        }
    }

    /// The routes with the admission middleware layered on.
    pub fn router(&self) -> Router {
        self.routes.clone().layer(middleware::from_fn_with_state(
            self.state.clone(),
            admission_middleware,
        ))
    }

    /// Bind the configured address and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;

        self.serve_listener(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    pub async fn serve_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router();

        info!(
            addr = %listener.local_addr()?,
            limit = self.state.limiter().config().limit,
            window_duration_ms = self.state.limiter().config().window_duration_ms,
            "Starting HTTP server with admission control"
        );

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}
