//! The working directory that every provisioned file lands in.
//!
//! Paths received from the orchestrator are relative to the workspace root.
//! They are validated before touching the disk: absolute paths, `..`
//! components and NUL bytes are rejected so a command can never write outside
//! the root.

use std::io;
use std::path::{Component, Path, PathBuf};

use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },
}

/// Local root directory for the deployed application.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an orchestrator-supplied relative path into the workspace.
    ///
    /// The empty path names the root itself. Both `/` and `\` separators are
    /// accepted since the orchestrator may run on either family of OS.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, WorkspaceError> {
        let invalid = |reason| WorkspaceError::InvalidPath {
            path: relative.to_string(),
            reason,
        };
        if relative.contains('\0') {
            return Err(invalid("contains null bytes"));
        }
        let normalized = relative.replace('\\', "/");
        let candidate = Path::new(&normalized);
        let mut resolved = self.root.clone();
        for component in candidate.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir => return Err(invalid("path traversal (..) not allowed")),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid("path must be relative"));
                }
            }
        }
        Ok(resolved)
    }

    /// Recursively delete the root. A root that does not exist counts as deleted.
    pub async fn remove(&self) -> Result<(), WorkspaceError> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(io_error("remove", &self.root, source)),
        }
    }

    /// Create the (empty) root directory and its parents.
    pub async fn create_root(&self) -> Result<(), WorkspaceError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| io_error("create directory", &self.root, source))
    }

    /// Create `relative` and any missing parents under the root.
    pub async fn create_dir(&self, relative: &str) -> Result<PathBuf, WorkspaceError> {
        let path = self.resolve(relative)?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| io_error("create directory", &path, source))?;
        Ok(path)
    }

    /// Create or truncate `relative` and write `content` to it.
    ///
    /// The parent directory must already exist, mirroring the orchestrator
    /// which always sends `directory` lines before the files inside them.
    pub async fn write_file(&self, relative: &str, content: &[u8]) -> Result<PathBuf, WorkspaceError> {
        let path = self.resolve(relative)?;
        if path == self.root {
            return Err(WorkspaceError::InvalidPath {
                path: relative.to_string(),
                reason: "file path must not be empty",
            });
        }
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|source| io_error("create file", &path, source))?;
        file.write_all(content)
            .await
            .map_err(|source| io_error("write file", &path, source))?;
        file.flush()
            .await
            .map_err(|source| io_error("write file", &path, source))?;
        Ok(path)
    }

    /// Absolute path of the root without resolving symlinks.
    pub fn absolute_root(&self) -> Result<PathBuf, WorkspaceError> {
        std::path::absolute(&self.root).map_err(|source| io_error("resolve", &self.root, source))
    }

    /// Absolute path of `relative` without resolving symlinks.
    pub fn absolute(&self, relative: &Path) -> Result<PathBuf, WorkspaceError> {
        let joined = self.root.join(relative);
        std::path::absolute(&joined).map_err(|source| io_error("resolve", &joined, source))
    }
}

fn io_error(op: &'static str, path: &Path, source: io::Error) -> WorkspaceError {
    WorkspaceError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}
