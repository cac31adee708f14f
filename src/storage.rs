//! Upload directory layout and generated file names.

use chrono::Utc;
use rand::RngCore;
use rand::rngs::OsRng;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use crate::atomic::AtomicFile;
use crate::config::MAX_EXTENSION_LEN;

/// Flat directory holding uploaded files under generated names.
#[derive(Clone, Debug)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Creates the upload directory if needed. Idempotent.
    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Resolves a stored file name; anything but a single plain component is rejected.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, StorageError> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(segment)), None) => Ok(self.root.join(segment)),
            _ => Err(StorageError::InvalidName),
        }
    }

    /// Opens a staging file that becomes `name` once finalized.
    pub async fn stage(&self, name: &str) -> Result<AtomicFile, StorageError> {
        let target = self.resolve(name)?;
        Ok(AtomicFile::new(&target).await?)
    }
}

#[derive(Debug)]
pub enum StorageError {
    InvalidName,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::InvalidName => f.write_str("invalid stored file name"),
            StorageError::Io(err) => write!(f, "{err}"),
        }
    }
}

/// `<unix_nanos>-<16 hex chars><ext>`, with 8 bytes from the OS CSPRNG.
pub fn generate_file_name(original: &str) -> String {
    let mut random = [0u8; 8];
    OsRng.fill_bytes(&mut random);
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{nanos}-{}{}", hex::encode(random), safe_extension(original))
}

/// Extension of the client filename's basename, dot included.
///
/// Both `/` and `\` count as separators. Extensions that are too long or
/// contain anything other than ASCII alphanumerics are dropped.
pub fn safe_extension(original: &str) -> String {
    let basename = original.rsplit(['/', '\\']).next().unwrap_or_default();
    let Some(dot) = basename.rfind('.') else {
        return String::new();
    };
    let ext = &basename[dot + 1..];
    if ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.bytes().all(|byte| byte.is_ascii_alphanumeric())
    {
        return String::new();
    }
    format!(".{ext}")
}
