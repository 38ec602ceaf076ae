//! In-process state store.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::store::{StateStore, StoreError, WindowMapping};
use super::window::ClientWindowState;

/// Keeps the mapping in memory. State is lost on restart.
///
/// Keyed operations take the write lock for a single entry, so they are
/// atomic per call. The store can be switched offline to exercise the
/// unavailable path.
#[derive(Debug)]
pub struct MemoryStore {
    mapping: RwLock<WindowMapping>,
    available: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_mapping(WindowMapping::new())
    }

    /// Create a store seeded with existing state.
    pub fn with_mapping(mapping: WindowMapping) -> Self {
        Self {
            mapping: RwLock::new(mapping),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle availability. While unavailable every operation fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of clients with recorded state.
    pub fn client_count(&self) -> usize {
        self.mapping.read().len()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<WindowMapping, StoreError> {
        self.ensure_available()?;
        Ok(self.mapping.read().clone())
    }

    async fn save(&self, mapping: &WindowMapping) -> Result<(), StoreError> {
        self.ensure_available()?;
        *self.mapping.write() = mapping.clone();
        Ok(())
    }

    async fn load_client(&self, client_id: &str) -> Result<Option<ClientWindowState>, StoreError> {
        self.ensure_available()?;
        Ok(self.mapping.read().get(client_id).copied())
    }

    async fn save_client(
        &self,
        client_id: &str,
        state: ClientWindowState,
    ) -> Result<(), StoreError> {
        self.ensure_available()?;
        self.mapping.write().insert(client_id.to_string(), state);
        Ok(())
    }
}
