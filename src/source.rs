//! Resource reader: maps request paths onto the project root.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use tokio::fs;

use crate::{PipelineError, Result};

/// Raw source read for one compute. Never stored.
#[derive(Debug, Clone)]
pub struct Resource {
    pub filepath: PathBuf,
    pub raw_source: String,
    pub last_modified: SystemTime,
}

/// Resolves request paths against a fixed project root.
#[derive(Debug, Clone)]
pub struct ResourceReader {
    root: PathBuf,
}

impl ResourceReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Join `request_path` (leading `/` stripped) onto the root.
    ///
    /// Paths that could leave the root (`..`, a second root, a drive
    /// prefix) are rejected before the filesystem is touched.
    pub fn resolve(&self, request_path: &str) -> Result<PathBuf> {
        let rel = Path::new(request_path.strip_prefix('/').unwrap_or(request_path));
        for component in rel.components() {
            if matches!(
                component,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            ) {
                return Err(PipelineError::PathEscapesRoot {
                    path: request_path.to_string(),
                });
            }
        }
        Ok(self.root.join(rel))
    }

    /// Current modification time of the file behind `request_path`.
    pub async fn modified(&self, request_path: &str) -> Result<SystemTime> {
        let filepath = self.resolve(request_path)?;
        let meta = fs::metadata(&filepath)
            .await
            .map_err(|e| PipelineError::io(&filepath, e))?;
        meta.modified().map_err(|e| PipelineError::io(&filepath, e))
    }

    /// Read the file behind `request_path`.
    ///
    /// The timestamp is taken before the content is read, so the content is
    /// never older than the timestamp that gets cached alongside it.
    pub async fn read(&self, request_path: &str) -> Result<Resource> {
        let filepath = self.resolve(request_path)?;
        let meta = fs::metadata(&filepath)
            .await
            .map_err(|e| PipelineError::io(&filepath, e))?;
        if !meta.is_file() {
            return Err(PipelineError::NotFound { path: filepath });
        }
        let last_modified = meta
            .modified()
            .map_err(|e| PipelineError::io(&filepath, e))?;

        let raw_source = fs::read_to_string(&filepath)
            .await
            .map_err(|e| PipelineError::io(&filepath, e))?;

        Ok(Resource {
            filepath,
            raw_source,
            last_modified,
        })
    }
}
