//! Artifact storage: download generated audio to a locally owned directory
//! and delete files released by cache eviction. Deletion is idempotent —
//! removing a path that is already gone is not an error.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum StorageError {
    Download(String),
    Io(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Download(msg) => write!(f, "download failed: {msg}"),
            StorageError::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Local artifact storage seam. The cache calls `delete` during eviction;
/// the orchestrator calls `download` after a successful generation.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Fetch `url` into the store under `filename`, returning the local path.
    async fn download(&self, url: &str, filename: &str) -> Result<PathBuf, StorageError>;

    /// Remove a previously downloaded file. Missing files are ignored.
    async fn delete(&self, local_path: &Path) -> Result<(), StorageError>;
}

/// Filesystem-backed artifact store. Owns one audio directory; nothing else
/// is allowed to delete files referenced by live cache entries.
pub struct FsArtifactStore {
    http: reqwest::Client,
    audio_dir: PathBuf,
}

impl FsArtifactStore {
    pub fn new(audio_dir: impl Into<PathBuf>) -> Self {
        Self {
            http: reqwest::Client::new(),
            audio_dir: audio_dir.into(),
        }
    }

    pub fn audio_dir(&self) -> &Path {
        &self.audio_dir
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn download(&self, url: &str, filename: &str) -> Result<PathBuf, StorageError> {
        tokio::fs::create_dir_all(&self.audio_dir)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;

        let target = self.audio_dir.join(filename);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| StorageError::Download(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StorageError::Download(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        // Stream to a temp path first so an aborted download never leaves a
        // half-written file under the final name.
        let partial = target.with_extension("part");
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| StorageError::Download(e.to_string()))?;
            file.write_all(&bytes)
                .await
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }
        file.flush()
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        drop(file);

        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;

        debug!(path = %target.display(), "artifact downloaded");
        Ok(target)
    }

    async fn delete(&self, local_path: &Path) -> Result<(), StorageError> {
        match tokio::fs::remove_file(local_path).await {
            Ok(()) => {
                debug!(path = %local_path.display(), "artifact deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = %local_path.display(), error = %e, "artifact delete failed");
                Err(StorageError::Io(e.to_string()))
            }
        }
    }
}
