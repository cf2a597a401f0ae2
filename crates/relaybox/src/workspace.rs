//! Per-session workspace directories
//!
//! Every session gets a private directory under the execution root. All files
//! written for the session live inside it, so releasing the workspace removes
//! the source, the harness, any compiled binary and whatever the program
//! itself wrote.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::Language;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid file name: {0}")]
    InvalidName(String),
}

/// Allocates session workspaces under a root directory
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `content` into a fresh workspace as `code_<token>.<ext>`
    #[instrument(skip(self, content), fields(root = %self.root.display()))]
    pub async fn allocate(
        &self,
        content: &str,
        language: Language,
    ) -> Result<Workspace, WorkspaceError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| WorkspaceError::CreateDir {
                path: self.root.clone(),
                source,
            })?;

        let token = Uuid::new_v4().simple().to_string();
        let dir = self.root.join(format!("session_{token}"));
        tokio::fs::create_dir(&dir)
            .await
            .map_err(|source| WorkspaceError::CreateDir {
                path: dir.clone(),
                source,
            })?;

        let mut workspace = Workspace {
            dir,
            source_name: format!("code_{token}.{}", language.extension()),
            token,
            files: Vec::new(),
            released: false,
        };

        let source_name = workspace.source_name.clone();
        if let Err(e) = workspace.write_file(&source_name, content.as_bytes()).await {
            workspace.release().await.ok();
            return Err(e);
        }

        debug!(dir = %workspace.dir.display(), "allocated workspace");
        Ok(workspace)
    }
}

/// A session's private directory and the files written into it
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
    token: String,
    source_name: String,
    files: Vec<PathBuf>,
    released: bool,
}

impl Workspace {
    /// The directory holding every file of this session
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 128-bit random token shared by the directory and the source file name
    pub fn token(&self) -> &str {
        &self.token
    }

    /// File name of the submitted source inside [`dir`](Self::dir)
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Absolute host path of the submitted source
    pub fn source_path(&self) -> PathBuf {
        self.dir.join(&self.source_name)
    }

    /// Files created for this session so far
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Host path for a file inside the workspace.
    ///
    /// Only plain file names are accepted.
    pub fn file_path(&self, name: &str) -> Result<PathBuf, WorkspaceError> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(WorkspaceError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(name))
    }

    /// Write a file into the workspace and track it for removal
    pub async fn write_file(
        &mut self,
        name: &str,
        content: &[u8],
    ) -> Result<PathBuf, WorkspaceError> {
        let path = self.track(name)?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|source| WorkspaceError::Write {
                path: path.clone(),
                source,
            })?;
        debug!(?path, len = content.len(), "wrote workspace file");
        Ok(path)
    }

    /// Track a file that something else (e.g. a compiler) will create
    pub fn track(&mut self, name: &str) -> Result<PathBuf, WorkspaceError> {
        let path = self.file_path(name)?;
        if !self.files.contains(&path) {
            self.files.push(path.clone());
        }
        Ok(path)
    }

    /// Loosen directory permissions so a sandbox user with a different uid
    /// can create files in it
    pub async fn share_with_sandbox(&self) -> Result<(), WorkspaceError> {
        use std::os::unix::fs::PermissionsExt;

        tokio::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o777))
            .await
            .map_err(|source| WorkspaceError::Write {
                path: self.dir.clone(),
                source,
            })
    }

    /// Remove every tracked file and the workspace directory.
    ///
    /// Missing files count as removed. Calling this again is a no-op.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub async fn release(&mut self) -> Result<(), WorkspaceError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        for path in &self.files {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(?path, error = %e, "failed to remove workspace file"),
            }
        }

        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(WorkspaceError::Remove {
                    path: self.dir.clone(),
                    source,
                });
            }
        }

        debug!(files = self.files.len(), "released workspace");
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(
            dir = %self.dir.display(),
            "workspace dropped without release, removing synchronously"
        );
        if let Err(e) = std::fs::remove_dir_all(&self.dir)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(dir = %self.dir.display(), error = %e, "best-effort workspace removal failed");
        }
    }
}
