//! Resolution of URL file ids to media files on disk.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid media id: {0}")]
    InvalidId(String),
    #[error("media file not found: {0}")]
    NotFound(String),
    #[error("catalog io error: {0}")]
    Io(#[from] io::Error),
}

/// Maps the `{file}` path component of a request to an absolute path.
#[async_trait]
pub trait MediaCatalog: Send + Sync + 'static {
    async fn find_media_file(&self, id: &str) -> Result<PathBuf, CatalogError>;
}

/// Serves regular files that live directly under one root directory.
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl MediaCatalog for DirectoryCatalog {
    async fn find_media_file(&self, id: &str) -> Result<PathBuf, CatalogError> {
        if id.is_empty()
            || id.starts_with('.')
            || id.contains(['/', '\\', '\0'])
        {
            return Err(CatalogError::InvalidId(id.to_string()));
        }

        let root = tokio::fs::canonicalize(&self.root).await?;
        let candidate = match tokio::fs::canonicalize(root.join(id)).await {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CatalogError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        // Symlinks pointing out of the root are treated as traversal.
        if !candidate.starts_with(&root) {
            return Err(CatalogError::InvalidId(id.to_string()));
        }
        let meta = tokio::fs::metadata(&candidate).await?;
        if !meta.is_file() {
            return Err(CatalogError::NotFound(id.to_string()));
        }
        Ok(candidate)
    }
}
