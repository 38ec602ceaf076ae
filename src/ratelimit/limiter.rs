//! Core rate limiter: store read, window policy, store write.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace};

use super::store::{StateStore, StoreError};
use super::window::{self, ClientWindowState, Decision};
use crate::error::{GatekeeperError, Result};

/// Default number of requests admitted per window.
pub const DEFAULT_LIMIT: u64 = 3;
/// Default window size in milliseconds.
pub const DEFAULT_WINDOW_DURATION_MS: u64 = 1000;

/// How concurrent evaluations for the same client are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Whole-mapping load and save with no serialization.
    ///
    /// Two concurrent requests from one client can both load before either
    /// saves, and the second save then overwrites the first. Only suitable
    /// when a single request is in flight at a time.
    Snapshot,
    /// Requests for the same client are serialized by a per-client lock and
    /// use the store's keyed operations.
    #[default]
    PerClient,
}

/// Immutable limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum requests per window per client
    #[serde(default = "default_limit")]
    pub limit: u64,
    /// Window size in milliseconds
    #[serde(default = "default_window_duration_ms")]
    pub window_duration_ms: u64,
    /// Ordering of concurrent requests from one client
    #[serde(default)]
    pub consistency: Consistency,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            window_duration_ms: DEFAULT_WINDOW_DURATION_MS,
            consistency: Consistency::default(),
        }
    }
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

fn default_window_duration_ms() -> u64 {
    DEFAULT_WINDOW_DURATION_MS
}

impl LimiterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(GatekeeperError::Config(
                "limit must be greater than zero".to_string(),
            ));
        }
        if self.window_duration_ms == 0 {
            return Err(GatekeeperError::Config(
                "window_duration_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// The outcome of evaluating one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitResult {
    /// Whether the request may proceed
    pub admitted: bool,
    /// Configured requests per window
    pub limit: u64,
    /// Requests left in the current window after this one
    pub remaining: u64,
    /// Set on denial: how long the client should wait
    pub retry_after_ms: Option<u64>,
}

impl LimitResult {
    /// Retry interval in whole seconds, rounded up and never below one.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        self.retry_after_ms.map(retry_after_seconds)
    }
}

/// Whole seconds for a millisecond interval, rounded up and never below one.
pub fn retry_after_seconds(ms: u64) -> u64 {
    ms.div_ceil(1000).max(1)
}

enum Step {
    Denied(LimitResult),
    Admitted(ClientWindowState, LimitResult),
}

/// Fixed-window rate limiter over a [`StateStore`].
///
/// Each evaluation performs exactly one store read and at most one store
/// write. Denied requests are not written.
pub struct Limiter {
    store: Arc<dyn StateStore>,
    config: LimiterConfig,
    /// Per-client locks for [`Consistency::PerClient`]
    client_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Limiter {
    /// Create a limiter, rejecting an invalid configuration.
    pub fn new(store: Arc<dyn StateStore>, config: LimiterConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            store,
            config,
            client_locks: DashMap::new(),
        })
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Evaluate one request from `client_id` at `now_ms` (milliseconds since
    /// the Unix epoch).
    ///
    /// `client_id` must be non-empty. A store failure is returned as-is and
    /// never retried.
    pub async fn evaluate(
        &self,
        client_id: &str,
        now_ms: u64,
    ) -> std::result::Result<LimitResult, StoreError> {
        debug_assert!(!client_id.is_empty(), "client id must be non-empty");

        let result = match self.config.consistency {
            Consistency::Snapshot => self.evaluate_snapshot(client_id, now_ms).await,
            Consistency::PerClient => {
                let lock = self.client_lock(client_id);
                let _guard = lock.lock().await;
                self.evaluate_keyed(client_id, now_ms).await
            }
        };

        if let Err(ref e) = result {
            error!(client_id = %client_id, error = %e, "Rate limit state store unavailable");
        }

        result
    }

    async fn evaluate_snapshot(
        &self,
        client_id: &str,
        now_ms: u64,
    ) -> std::result::Result<LimitResult, StoreError> {
        let mut mapping = self.store.load().await?;
        let state = mapping
            .get(client_id)
            .copied()
            .unwrap_or_else(ClientWindowState::sentinel);

        match self.step(client_id, state, now_ms) {
            Step::Denied(result) => Ok(result),
            Step::Admitted(next, result) => {
                mapping.insert(client_id.to_string(), next);
                self.store.save(&mapping).await?;
                Ok(result)
            }
        }
    }

    async fn evaluate_keyed(
        &self,
        client_id: &str,
        now_ms: u64,
    ) -> std::result::Result<LimitResult, StoreError> {
        let state = self
            .store
            .load_client(client_id)
            .await?
            .unwrap_or_else(ClientWindowState::sentinel);

        match self.step(client_id, state, now_ms) {
            Step::Denied(result) => Ok(result),
            Step::Admitted(next, result) => {
                self.store.save_client(client_id, next).await?;
                Ok(result)
            }
        }
    }

    fn step(&self, client_id: &str, state: ClientWindowState, now_ms: u64) -> Step {
        let limit = self.config.limit;
        let current = window::current_window(now_ms, self.config.window_duration_ms);

        trace!(
            client_id = %client_id,
            window_id = current,
            stored_window_id = state.window_id,
            request_count = state.request_count,
            "Checking rate limit"
        );

        match window::evaluate(&state, current, limit) {
            Decision::Deny => {
                info!(
                    client_id = %client_id,
                    window_id = current,
                    limit = limit,
                    "Rate limit exceeded"
                );
                Step::Denied(LimitResult {
                    admitted: false,
                    limit,
                    remaining: 0,
                    retry_after_ms: Some(self.config.window_duration_ms),
                })
            }
            Decision::Admit => {
                let next = window::advance(state, current);
                let remaining = limit.saturating_sub(next.request_count);
                debug!(
                    client_id = %client_id,
                    window_id = next.window_id,
                    remaining = remaining,
                    "Request admitted"
                );
                Step::Admitted(
                    next,
                    LimitResult {
                        admitted: true,
                        limit,
                        remaining,
                        retry_after_ms: None,
                    },
                )
            }
        }
    }

    fn client_lock(&self, client_id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.client_locks.get(client_id) {
            return Arc::clone(lock.value());
        }

        Arc::clone(
            self.client_locks
                .entry(client_id.to_string())
                .or_default()
                .value(),
        )
    }
}
