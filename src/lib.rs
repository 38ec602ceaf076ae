//! Gatekeeper - Fixed-Window Request Admission Control
//!
//! This crate gates inbound HTTP requests by client identity. Each client may
//! make a fixed number of requests per time window; the per-client counters
//! live in a pluggable state store that survives across requests.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
