//! Upload storage.
//!
//! The coordinator only sees the [`FileStore`] trait. [`LocalFileStore`]
//! keeps uploads as plain files under one directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Write `bytes` under `name` and return the full stored path.
    async fn save(&self, name: &str, bytes: &[u8]) -> Result<PathBuf>;

    /// Stored file paths, sorted.
    async fn list(&self) -> Result<Vec<PathBuf>>;

    /// Remove a stored file. Removing a missing file is not an error.
    async fn remove(&self, path: &Path) -> Result<()>;

    async fn exists(&self, path: &Path) -> bool;
}

#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn save(&self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(name);
        // Write to a .tmp sibling first so a directory scan never sees a
        // half-written upload.
        let tmp = self.root.join(format!("{name}.tmp"));
        let written = match tokio::fs::write(&tmp, bytes).await {
            Ok(()) => tokio::fs::rename(&tmp, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(path = %path.display(), bytes = bytes.len(), "stored upload");
        Ok(path)
    }

    async fn list(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                out.push(entry.path());
            }
        }
        out.sort();
        Ok(out)
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }
}

/// Reduce an uploaded file name to a safe single path component.
///
/// Keeps ASCII alphanumerics, `.`, `-` and `_`; whitespace becomes `_`; any
/// directory part is dropped. Returns `None` if nothing usable is left.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}
