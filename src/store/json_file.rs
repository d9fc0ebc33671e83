//! JSON file snapshot store.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::snapshot::{Snapshot, SnapshotStore};
use crate::error::PersistenceError;

/// Stores the snapshot as one pretty-printed JSON object.
///
/// Saves go to a sibling `.tmp` file which is fsynced and then renamed over
/// the previous snapshot, so a crash mid-write leaves the old file intact.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "snapshot".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError {
        let path = path.to_path_buf();
        move |source| PersistenceError::Io { path, source }
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        let body = serde_json::to_vec_pretty(snapshot)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(self.io_error(parent))?;
        }

        let tmp = self.tmp_path();
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(self.io_error(&tmp))?;
        file.write_all(&body).await.map_err(self.io_error(&tmp))?;
        file.sync_all().await.map_err(self.io_error(&tmp))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(self.io_error(&self.path))?;

        debug!(path = %self.path.display(), instances = snapshot.len(), "Snapshot saved");
        Ok(())
    }

    async fn load(&self) -> Result<Option<Snapshot>, PersistenceError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| PersistenceError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }
}
