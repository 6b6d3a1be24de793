//! The artifact store: one flat directory of uploads and converter outputs.
//!
//! Three parties delete from it without coordinating: the dispatcher when a
//! job is done with its input, the download handler after serving, and the
//! retention sweeper on its schedule.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::fs;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::ArtifactName;

const CLAIM_PREFIX: &str = ".claim-";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

#[derive(Debug)]
pub struct StoredEntry {
    pub path: PathBuf,
    pub file_name: String,
    pub modified: Option<SystemTime>,
}

impl ArtifactStore {
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(ArtifactStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, name: &ArtifactName) -> PathBuf {
        self.root.join(name.as_str())
    }

    /// Looks up an artifact by a caller-supplied name without consuming it.
    pub async fn resolve(&self, name: &str) -> Result<(ArtifactName, PathBuf), StoreError> {
        let name = ArtifactName::parse(name).ok_or_else(|| StoreError::InvalidName(name.to_owned()))?;
        let path = self.path_of(&name);

        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok((name, path)),
            Ok(_) => Err(StoreError::NotFound(name.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(name.to_string())),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// Takes exclusive ownership of an artifact by renaming it out of the
    /// public namespace. Of any number of concurrent claims, one wins and the
    /// rest see `NotFound`.
    pub async fn claim(&self, name: &str) -> Result<ClaimedArtifact, StoreError> {
        let (name, path) = self.resolve(name).await?;
        let claimed = self
            .root
            .join(format!("{CLAIM_PREFIX}{}-{}", Uuid::new_v4().simple(), name));

        match fs::rename(&path, &claimed).await {
            Ok(()) => Ok(ClaimedArtifact {
                name,
                path: claimed,
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(name.to_string())),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// Best-effort delete. Failures are logged, never returned.
    pub async fn remove(&self, path: &Path) {
        match fs::remove_file(path).await {
            Ok(()) => tracing::info!(path = %path.display(), "deleted file"),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "file already gone")
            }
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "failed to delete file"),
        }
    }

    pub async fn entries(&self) -> std::io::Result<Vec<StoredEntry>> {
        let mut entries = vec![];
        let mut dir = fs::read_dir(&self.root).await?;

        while let Some(entry) = dir.next_entry().await? {
            let modified = entry.metadata().await.and_then(|m| m.modified()).ok();
            entries.push(StoredEntry {
                path: entry.path(),
                file_name: entry.file_name().to_string_lossy().into_owned(),
                modified,
            });
        }

        Ok(entries)
    }
}

/// An artifact that has been taken out of the store's public namespace.
#[derive(Debug)]
pub struct ClaimedArtifact {
    pub name: ArtifactName,
    pub path: PathBuf,
}

impl ClaimedArtifact {
    pub fn purge_on_drop(&self) -> PurgeGuard {
        PurgeGuard::new(self.path.clone())
    }
}

/// Deletes its file when dropped.
#[derive(Debug)]
pub struct PurgeGuard {
    path: PathBuf,
}

impl PurgeGuard {
    pub fn new(path: PathBuf) -> Self {
        PurgeGuard { path }
    }
}

impl Drop for PurgeGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::info!(path = %self.path.display(), "deleted served file"),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "served file already gone")
            }
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to delete served file")
            }
        }
    }
}
