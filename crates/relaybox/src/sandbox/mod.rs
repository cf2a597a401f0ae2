//! Isolated process launch
//!
//! A [`Sandbox`] hands out one [`SandboxSlot`] per session. The slot knows how
//! the session workspace looks from inside the sandbox, runs the compile step
//! to completion, and finally spawns the long-lived session process as a
//! [`ChildProcess`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument, warn};

pub use crate::sandbox::child::ChildProcess;
use crate::config::{Config, SandboxKind};
use crate::isolate::{
    BoxPool, IsolateBox, IsolateError, WORKSPACE_MOUNT, resolve_command, run_captured,
    spawn_piped, validate_mounts,
};
use crate::types::{ExecutionResult, MountConfig, ResourceLimits};
use crate::workspace::{Workspace, WorkspaceError};

mod child;
mod process;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Isolate(#[from] IsolateError),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command is empty")]
    EmptyCommand,

    #[error("failed to prepare workspace: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A program to run inside a sandbox slot
#[derive(Debug, Clone)]
pub struct SandboxCommand {
    /// Program and arguments, already expanded to guest paths
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
    /// PATH inside the sandbox
    pub path: String,
    pub limits: ResourceLimits,
    /// Extra read-only mounts (isolate only)
    pub mounts: Vec<MountConfig>,
}

/// Launches sandboxed processes with the configured backend
#[derive(Debug, Clone)]
pub enum Sandbox {
    Isolate {
        pool: Arc<BoxPool>,
        mounts: Vec<MountConfig>,
    },
    Process,
}

impl Sandbox {
    pub fn from_config(config: &Config) -> Self {
        match config.backend {
            SandboxKind::Isolate => Sandbox::Isolate {
                pool: Arc::new(BoxPool::new(
                    config.box_pool.first_id,
                    config.box_pool.count,
                    config.isolate_binary(),
                    config.cgroup,
                )),
                mounts: config.sandbox_mounts.clone(),
            },
            SandboxKind::Process => Sandbox::Process,
        }
    }

    pub fn kind(&self) -> SandboxKind {
        match self {
            Sandbox::Isolate { .. } => SandboxKind::Isolate,
            Sandbox::Process => SandboxKind::Process,
        }
    }

    /// Reserve sandbox resources for one session's workspace
    #[instrument(skip(self, workspace), fields(backend = ?self.kind()))]
    pub async fn open(&self, workspace: &Workspace) -> Result<SandboxSlot, SandboxError> {
        let backend = match self {
            Sandbox::Isolate { pool, mounts } => {
                workspace.share_with_sandbox().await?;
                let sandbox = pool.acquire().await?;
                debug!(box_id = sandbox.id(), free = pool.available(), "opened isolate slot");
                SlotBackend::Isolate {
                    sandbox,
                    mounts: mounts.clone(),
                }
            }
            Sandbox::Process => SlotBackend::Process,
        };

        Ok(SandboxSlot {
            workspace_dir: workspace.dir().to_path_buf(),
            backend,
        })
    }
}

#[derive(Debug)]
enum SlotBackend {
    Isolate {
        sandbox: IsolateBox,
        mounts: Vec<MountConfig>,
    },
    Process,
}

/// Sandbox resources reserved for one session
#[derive(Debug)]
pub struct SandboxSlot {
    workspace_dir: PathBuf,
    backend: SlotBackend,
}

impl SandboxSlot {
    /// Path of a workspace file as the sandboxed program sees it
    pub fn guest_path(&self, name: &str) -> String {
        match self.backend {
            SlotBackend::Isolate { .. } => format!("{WORKSPACE_MOUNT}/{name}"),
            SlotBackend::Process => self.workspace_dir.join(name).to_string_lossy().into_owned(),
        }
    }

    /// Whether the backend itself kills processes that overrun the wall clock
    pub fn enforces_wall_clock(&self) -> bool {
        matches!(self.backend, SlotBackend::Isolate { .. })
    }

    /// Run a command to completion, returning its result and combined output
    #[instrument(skip(self, command), fields(program = ?command.argv.first()))]
    pub async fn run_to_completion(
        &self,
        command: SandboxCommand,
    ) -> Result<(ExecutionResult, String), SandboxError> {
        match &self.backend {
            SlotBackend::Isolate { sandbox, mounts } => {
                let command = isolate_command(sandbox, mounts, &self.workspace_dir, command)?;
                Ok(run_captured(sandbox, command).await?)
            }
            SlotBackend::Process => process::run_captured(command, &self.workspace_dir).await,
        }
    }

    /// Spawn the session process with piped stdio.
    ///
    /// The slot moves into the returned child; on failure its resources are
    /// released before the error is returned.
    #[instrument(skip(self, command), fields(program = ?command.argv.first()))]
    pub async fn spawn(self, command: SandboxCommand) -> Result<ChildProcess, SandboxError> {
        let SandboxSlot {
            workspace_dir,
            backend,
        } = self;

        match backend {
            SlotBackend::Isolate {
                mut sandbox,
                mounts,
            } => {
                let spawned = match isolate_command(&sandbox, &mounts, &workspace_dir, command) {
                    Ok(command) => spawn_piped(&sandbox, command).await.map_err(Into::into),
                    Err(e) => Err(e),
                };
                match spawned {
                    Ok((child, meta)) => Ok(ChildProcess::isolated(child, sandbox, meta)),
                    Err(e) => {
                        release_box(&mut sandbox).await;
                        Err(e)
                    }
                }
            }
            SlotBackend::Process => {
                let child = process::spawn(command, &workspace_dir)?;
                Ok(ChildProcess::local(child))
            }
        }
    }

    /// Release the slot without spawning anything
    pub async fn close(self) {
        if let SlotBackend::Isolate { mut sandbox, .. } = self.backend {
            release_box(&mut sandbox).await;
        }
    }
}

async fn release_box(sandbox: &mut IsolateBox) {
    if let Err(e) = sandbox.cleanup().await {
        warn!(box_id = sandbox.id(), error = %e, "failed to clean up isolate box");
    }
}

fn isolate_command(
    sandbox: &IsolateBox,
    mounts: &[MountConfig],
    workspace_dir: &Path,
    command: SandboxCommand,
) -> Result<crate::isolate::IsolateCommand, SandboxError> {
    validate_mounts(mounts.iter().chain(&command.mounts))?;

    let mut argv = command.argv;
    if argv.is_empty() {
        return Err(SandboxError::EmptyCommand);
    }
    resolve_command(&mut argv)?;

    let mut isolate = sandbox
        .command()
        .limits(command.limits)
        .workspace(workspace_dir.to_string_lossy())
        .mounts(mounts.iter().cloned())
        .mounts(command.mounts)
        .env("PATH", command.path)
        .env("HOME", WORKSPACE_MOUNT);
    for (key, value) in command.env {
        isolate = isolate.env(key, value);
    }
    Ok(isolate.command(argv))
}
