//! On-disk artifacts
//!
//! Artifacts are written to a temporary file in the cache directory and only
//! become visible under their final name through a single rename. A published
//! artifact is never modified again, only unlinked.

use crate::backing::ByteStream;
use crate::error::FetchFailure;
use crate::types::StreamToken;
use futures::StreamExt;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const TEMP_PREFIX: &str = ".fetch-";
const ARTIFACT_EXTENSION: &str = "mp3";

pub struct ArtifactStore {
    cache_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Ensure the cache directory exists and drop anything a previous process
    /// left in it. Returns the number of files removed.
    pub async fn init(&self) -> io::Result<usize> {
        fs::create_dir_all(&self.cache_dir).await?;

        let mut removed = 0;
        let mut dir = fs::read_dir(&self.cache_dir).await?;
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_file() {
                continue;
            }
            match fs::remove_file(item.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = ?item.path(), error = %e, "Failed to purge stale artifact"),
            }
        }

        info!(cache_dir = ?self.cache_dir, removed, "Artifact store initialized");
        Ok(removed)
    }

    /// Final location of the artifact for one entry generation
    pub fn artifact_path(&self, token: &StreamToken, generation: u64) -> PathBuf {
        self.cache_dir
            .join(format!("{}-{}.{}", token, generation, ARTIFACT_EXTENSION))
    }

    /// Stream `body` to disk and publish it at `final_path`.
    ///
    /// Returns the number of bytes published. On any failure the temporary
    /// file is removed and nothing appears at `final_path`.
    pub async fn materialize(
        &self,
        final_path: &Path,
        mut body: ByteStream,
        expected_len: Option<u64>,
    ) -> Result<u64, FetchFailure> {
        let dir = self.cache_dir.clone();
        let temp = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .tempfile_in(dir)
        })
        .await
        .map_err(|e| FetchFailure::Internal(format!("create task failed: {}", e)))?
        .map_err(|e| FetchFailure::Internal(format!("create temporary file: {}", e)))?;
        // Dropping `temp_path` on an early return deletes the file.
        let (file, temp_path) = temp.into_parts();
        let mut file = fs::File::from_std(file);

        let mut written: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| FetchFailure::Transient(format!("read body: {}", e)))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| FetchFailure::Internal(format!("write artifact: {}", e)))?;
            written += chunk.len() as u64;
        }

        file.flush()
            .await
            .map_err(|e| FetchFailure::Internal(format!("flush artifact: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| FetchFailure::Internal(format!("sync artifact: {}", e)))?;
        drop(file);

        if let Some(expected) = expected_len {
            if expected != written {
                return Err(FetchFailure::Transient(format!(
                    "truncated body: expected {} bytes, received {}",
                    expected, written
                )));
            }
        }

        let target = final_path.to_path_buf();
        tokio::task::spawn_blocking(move || temp_path.persist(&target))
            .await
            .map_err(|e| FetchFailure::Internal(format!("publish task failed: {}", e)))?
            .map_err(|e| FetchFailure::Internal(format!("publish artifact: {}", e.error)))?;

        debug!(path = ?final_path, size = written, "Published artifact");
        Ok(written)
    }

    /// Unlink an artifact. Returns false when it was already absent.
    pub async fn delete(&self, path: &Path) -> io::Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
