//! State store abstraction for per-client window state.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use super::window::ClientWindowState;

/// The full persisted mapping from client identifier to window state.
pub type WindowMapping = HashMap<String, ClientWindowState>;

/// Failures of the backing store.
///
/// Every variant means the store is unavailable for the current request.
/// None of them is retried.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing file does not exist
    #[error("state store unavailable: {} does not exist", path.display())]
    Missing { path: PathBuf },

    /// The persisted snapshot cannot be parsed
    #[error("state store unavailable: {} is malformed: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Reading or replacing the snapshot failed
    #[error("state store unavailable: {0}")]
    Io(#[from] std::io::Error),

    /// The backend reports itself offline
    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage for [`WindowMapping`].
///
/// `load` and `save` operate on the whole snapshot. `save` must replace the
/// snapshot atomically: a concurrent or later `load` sees either the previous
/// snapshot or the new one, never a partial write.
///
/// The keyed operations default to a whole-snapshot round trip. Backends that
/// can update a single client atomically should override them.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the entire persisted mapping.
    async fn load(&self) -> Result<WindowMapping, StoreError>;

    /// Replace the entire persisted mapping.
    async fn save(&self, mapping: &WindowMapping) -> Result<(), StoreError>;

    /// Read a single client's state.
    async fn load_client(&self, client_id: &str) -> Result<Option<ClientWindowState>, StoreError> {
        Ok(self.load().await?.get(client_id).copied())
    }

    /// Write a single client's state, leaving every other entry untouched.
    async fn save_client(
        &self,
        client_id: &str,
        state: ClientWindowState,
    ) -> Result<(), StoreError> {
        let mut mapping = self.load().await?;
        mapping.insert(client_id.to_string(), state);
        self.save(&mapping).await
    }
}
