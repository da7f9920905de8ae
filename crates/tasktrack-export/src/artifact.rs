//! Export artifact files.
//!
//! An artifact is written in place under the artifact directory, one file
//! per job. Resuming truncates the file back to the last checkpointed size
//! and appends from there.

use crate::error::ExportResult;
use crate::job::{ExportFormat, JobId};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter, SeekFrom};
use tracing::{debug, warn};

/// Owns the directory export artifacts are written to.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    /// Creates a store rooted at `dir`. The directory is created lazily.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the artifact for a job.
    pub fn path_for(&self, job_id: &JobId, format: ExportFormat) -> PathBuf {
        self.dir.join(format!("{}.{}", job_id, format.extension()))
    }

    /// Creates (or truncates) an artifact for a fresh run.
    pub async fn create(&self, path: &Path) -> ExportResult<ArtifactWriter> {
        fs::create_dir_all(&self.dir).await?;
        let file = File::create(path).await?;
        Ok(ArtifactWriter::new(path.to_path_buf(), file, 0))
    }

    /// Reopens an artifact, discarding anything past `checkpoint_size`.
    pub async fn reopen(&self, path: &Path, checkpoint_size: u64) -> ExportResult<ArtifactWriter> {
        let mut file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(checkpoint_size).await?;
        file.seek(SeekFrom::Start(checkpoint_size)).await?;
        debug!(path = %path.display(), checkpoint_size, "Reopened artifact");
        Ok(ArtifactWriter::new(path.to_path_buf(), file, checkpoint_size))
    }
}

/// Returns true if the file exists. Errors count as absent.
pub async fn artifact_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Deletes an artifact. Returns true if a file was removed.
pub async fn remove_artifact(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Removed artifact");
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove artifact");
            false
        }
    }
}

/// Reads a whole artifact.
pub async fn read_artifact(path: &Path) -> ExportResult<Vec<u8>> {
    Ok(fs::read(path).await?)
}

/// Buffered append-only writer that tracks the file size.
#[derive(Debug)]
pub struct ArtifactWriter {
    path: PathBuf,
    inner: BufWriter<File>,
    size: u64,
}

impl ArtifactWriter {
    fn new(path: PathBuf, file: File, size: u64) -> Self {
        Self {
            path,
            inner: BufWriter::new(file),
            size,
        }
    }

    /// Artifact path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far, including buffered bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends bytes.
    pub async fn write(&mut self, bytes: &[u8]) -> ExportResult<()> {
        self.inner.write_all(bytes).await?;
        self.size += bytes.len() as u64;
        Ok(())
    }

    /// Pushes buffered bytes to the OS so `size` is what a reader sees.
    pub async fn flush(&mut self) -> ExportResult<()> {
        self.inner.flush().await?;
        Ok(())
    }

    /// Flushes and syncs the file. Returns the final size.
    pub async fn finish(mut self) -> ExportResult<u64> {
        self.inner.flush().await?;
        self.inner.get_mut().sync_all().await?;
        Ok(self.size)
    }
}
