//! JSON snapshot store backed by a single file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::store::{StateStore, StoreError, WindowMapping};
use super::window::ClientWindowState;

/// Persists the whole [`WindowMapping`] as one JSON object.
///
/// Saves go to a sibling temp file which is fsynced and then renamed over the
/// target, so a reader never observes a truncated snapshot.
pub struct JsonFileStore {
    path: PathBuf,
    /// Serializes keyed read-modify-write cycles against the file
    write_lock: Mutex<()>,
    tmp_seq: AtomicU64,
}

impl JsonFileStore {
    /// Create a store for the given path. The file is not touched.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            tmp_seq: AtomicU64::new(0),
        }
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write an empty snapshot if the file does not exist yet.
    ///
    /// Returns `true` if a file was created.
    pub async fn initialize(&self) -> Result<bool, StoreError> {
        if tokio::fs::try_exists(&self.path).await? {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        self.save(&WindowMapping::new()).await?;
        info!(path = %self.path.display(), "Created empty state snapshot");
        Ok(true)
    }

    fn tmp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string());
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);

        self.path
            .with_file_name(format!(".{}.{}.{}.tmp", name, std::process::id(), seq))
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> Result<WindowMapping, StoreError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::Missing {
                    path: self.path.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&contents).map_err(|source| StoreError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    async fn save(&self, mapping: &WindowMapping) -> Result<(), StoreError> {
        let bytes = encode(mapping)?;
        let path = self.path.clone();
        let tmp = self.tmp_path();

        // Runs to completion even if this future is dropped, so the temp
        // file is always either renamed or removed.
        let written = tokio::task::spawn_blocking(move || replace_file(&path, &tmp, &bytes))
            .await
            .unwrap_or_else(|e| Err(io::Error::other(e)));

        if let Err(e) = written {
            warn!(path = %self.path.display(), error = %e, "Failed to replace state snapshot");
            return Err(e.into());
        }

        debug!(path = %self.path.display(), clients = mapping.len(), "State snapshot saved");
        Ok(())
    }

    async fn save_client(
        &self,
        client_id: &str,
        state: ClientWindowState,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut mapping = self.load().await?;
        mapping.insert(client_id.to_string(), state);
        self.save(&mapping).await
    }
}

fn encode(mapping: &WindowMapping) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(mapping).map_err(encode_error)
}

/// A snapshot that cannot be serialized is a write failure, not a bad file.
fn encode_error(err: serde_json::Error) -> StoreError {
    StoreError::Io(io::Error::other(err))
}

/// Write `bytes` to `tmp`, fsync, then rename over `path`. The temp file is
/// removed on any failure.
fn replace_file(path: &Path, tmp: &Path, bytes: &[u8]) -> io::Result<()> {
    let result = fs::File::create(tmp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(tmp, path));

    if result.is_err() {
        let _ = fs::remove_file(tmp);
    }
    result
}
