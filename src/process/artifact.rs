//! Per-instance config artifact handed to the worker.
//!
//! The artifact is a plain `KEY=value` file, one pair per line, in config
//! insertion order. The worker receives its path as the last argument.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::ArtifactError;
use crate::instances::model::{InstanceConfig, InstanceId};

/// Writes and removes `config_<id>` files under one directory.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stable artifact path for an instance.
    pub fn path_for(&self, id: &InstanceId) -> PathBuf {
        self.dir.join(format!("config_{id}"))
    }

    /// Render and write the artifact, replacing any previous one.
    pub async fn write(
        &self,
        id: &InstanceId,
        config: &InstanceConfig,
    ) -> Result<PathBuf, ArtifactError> {
        let path = self.path_for(id);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| ArtifactError::Write {
                path: self.dir.clone(),
                source,
            })?;
        tokio::fs::write(&path, render(config))
            .await
            .map_err(|source| ArtifactError::Write {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    /// Remove the artifact. A missing file is not an error.
    pub async fn remove(&self, id: &InstanceId) -> Result<(), ArtifactError> {
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ArtifactError::Remove { path, source }),
        }
    }
}

/// `KEY=value` lines joined by `\n`, no trailing newline.
pub fn render(config: &InstanceConfig) -> String {
    config
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InstanceConfig {
        [("EMAIL", "a@b.c"), ("COUNTRY", "ca"), ("NEED_ASC", "False")]
            .into_iter()
            .collect()
    }

    #[test]
    fn renders_in_insertion_order() {
        assert_eq!(render(&sample()), "EMAIL=a@b.c\nCOUNTRY=ca\nNEED_ASC=False");
        assert_eq!(render(&InstanceConfig::new()), "");
    }

    #[tokio::test]
    async fn write_creates_directory_and_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(tmp.path().join("nested"));
        let id = InstanceId::new("1700000000000");

        let path = writer.write(&id, &sample()).await.unwrap();
        assert!(path.ends_with("config_1700000000000"));

        let mut config = sample();
        config.insert("COUNTRY", "us");
        writer.write(&id, &config).await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "EMAIL=a@b.c\nCOUNTRY=us\nNEED_ASC=False");
    }

    #[tokio::test]
    async fn remove_tolerates_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(tmp.path());
        let id = InstanceId::new("7");

        writer.remove(&id).await.unwrap();
        let path = writer.write(&id, &sample()).await.unwrap();
        writer.remove(&id).await.unwrap();
        assert!(!path.exists());
    }
}
