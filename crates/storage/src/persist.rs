use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use snafu::ResultExt;

use super::PersistHook;
use super::error::{
    CreateSnapshotDirectorySnafu, DecodeSnapshotSnafu, EncodeSnapshotSnafu, ReadSnapshotSnafu,
    ReplaceSnapshotSnafu, StorageResult, WriteSnapshotSnafu,
};
use super::types::StoreSnapshot;

/// Saves the whole store as pretty JSON, replacing the file atomically.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistHook for JsonFilePersistence {
    fn persist(&self, snapshot: &StoreSnapshot) -> StorageResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateSnapshotDirectorySnafu {
                stage: "create-snapshot-directory",
                path: display_path(parent),
            })?;
        }

        let content = serde_json::to_string_pretty(snapshot).context(EncodeSnapshotSnafu {
            stage: "encode-snapshot-json",
        })?;

        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteSnapshotSnafu {
            stage: "write-temporary-snapshot",
            path: display_path(&temp_path),
        })?;

        std::fs::rename(&temp_path, &self.path).context(ReplaceSnapshotSnafu {
            stage: "rename-temporary-snapshot",
            from: display_path(&temp_path),
            to: display_path(&self.path),
        })
    }

    fn rehydrate(&self) -> StorageResult<Option<StoreSnapshot>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no conversation snapshot yet");
                return Ok(None);
            }
            Err(source) => {
                return Err(source).context(ReadSnapshotSnafu {
                    stage: "read-snapshot",
                    path: display_path(&self.path),
                });
            }
        };

        if content.trim().is_empty() {
            return Ok(None);
        }

        let snapshot = serde_json::from_str(&content).context(DecodeSnapshotSnafu {
            stage: "decode-snapshot-json",
            path: display_path(&self.path),
        })?;
        Ok(Some(snapshot))
    }
}

/// Keeps the last saved snapshot in memory.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    saved: Mutex<Option<StoreSnapshot>>,
    save_count: AtomicUsize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(snapshot: StoreSnapshot) -> Self {
        Self {
            saved: Mutex::new(Some(snapshot)),
            save_count: AtomicUsize::new(0),
        }
    }

    pub fn saved(&self) -> Option<StoreSnapshot> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }
}

impl PersistHook for MemoryPersistence {
    fn persist(&self, snapshot: &StoreSnapshot) -> StorageResult<()> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rehydrate(&self) -> StorageResult<Option<StoreSnapshot>> {
        Ok(self.saved())
    }
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}
