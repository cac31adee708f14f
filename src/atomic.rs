//! Staged writes: data lands in a hidden sibling file and is renamed into place.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Temporary file that replaces `target` on [`finalize`](Self::finalize).
///
/// If the value is dropped without being finalized (an aborted or timed-out
/// request drops the handler future) the staging file is removed.
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: Option<File>,
    written: u64,
}

impl AtomicFile {
    /// Creates the staging file next to the target.
    pub async fn new(target: &Path) -> io::Result<Self> {
        let parent = target.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "target has no parent directory")
        })?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_name = format!(".{base}.part.{}", Uuid::new_v4());
        let temp_path = parent.join(temp_name);
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file: Some(file),
            written: 0,
        })
    }

    fn file_mut(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("staging file already closed"))
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.file_mut()?.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Drops the staging file.
    pub async fn cleanup(mut self) {
        self.file.take();
        if fs::remove_file(&self.temp_path).await.is_ok() {
            self.temp_path = PathBuf::new();
        }
    }

    /// Flushes, syncs and renames the staging file onto the target.
    pub async fn finalize(mut self) -> io::Result<PathBuf> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| io::Error::other("staging file already closed"))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&self.temp_path, &self.target).await?;
        self.temp_path = PathBuf::new();

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }

        Ok(std::mem::take(&mut self.target))
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        self.file.take();
        if !self.temp_path.as_os_str().is_empty() {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
