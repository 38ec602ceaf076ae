//! Fixed-window policy: window bucketing and the admit/deny decision.
//!
//! Everything in this module is pure. Persistence and clocks live elsewhere.

use serde::{Deserialize, Serialize};

/// Per-client window state as persisted by a [`StateStore`](super::StateStore).
///
/// The serialized field names follow the on-disk snapshot layout
/// (`lastRequestTime` / `numberOfRequest`); `windowId` / `requestCount` are
/// accepted on read as well.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientWindowState {
    /// Most recent window in which the client made a request
    #[serde(rename = "lastRequestTime", alias = "windowId")]
    pub window_id: u64,
    /// Requests recorded within `window_id`
    #[serde(rename = "numberOfRequest", alias = "requestCount")]
    pub request_count: u64,
}

impl ClientWindowState {
    /// The state materialized for a client seen for the first time.
    ///
    /// Window 0 never matches a real window, so the sentinel is always
    /// admitted.
    pub const fn sentinel() -> Self {
        Self {
            window_id: 0,
            request_count: 0,
        }
    }
}

/// Outcome of evaluating a client's state against the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed
    Admit,
    /// The client has exhausted its quota for the current window
    Deny,
}

/// Compute the window identifier for a timestamp in milliseconds.
///
/// Floor division, so a timestamp exactly on a boundary belongs to the new
/// window.
pub fn current_window(now_ms: u64, window_duration_ms: u64) -> u64 {
    now_ms / window_duration_ms
}

/// Decide whether a request in `current_window` is admitted.
///
/// The check runs against the pre-increment count.
pub fn evaluate(state: &ClientWindowState, current_window: u64, limit: u64) -> Decision {
    let window = effective_window(state, current_window);

    if state.window_id == window && state.request_count >= limit {
        Decision::Deny
    } else {
        Decision::Admit
    }
}

/// Record one request in `current_window`, starting a fresh count when the
/// window has moved on.
pub fn advance(state: ClientWindowState, current_window: u64) -> ClientWindowState {
    let window = effective_window(&state, current_window);

    let base = if window > state.window_id {
        0
    } else {
        state.request_count
    };

    ClientWindowState {
        window_id: window,
        request_count: base.saturating_add(1),
    }
}

/// A clock that stepped backwards still counts against the stored window,
/// which keeps `window_id` non-decreasing.
fn effective_window(state: &ClientWindowState, current_window: u64) -> u64 {
    current_window.max(state.window_id)
}
