//! Rate limiting logic and state management.

mod clock;
mod file_store;
mod limiter;
mod memory_store;
mod store;
pub mod window;

pub use clock::{Clock, SystemClock};
#[cfg(test)]
pub(crate) use clock::ManualClock;
pub use file_store::JsonFileStore;
pub use limiter::{
    retry_after_seconds, Consistency, LimitResult, Limiter, LimiterConfig, DEFAULT_LIMIT,
    DEFAULT_WINDOW_DURATION_MS,
};
pub use memory_store::MemoryStore;
pub use store::{StateStore, StoreError, WindowMapping};
pub use window::{ClientWindowState, Decision};
