//! IOI Isolate wrapper
//!
//! Command building, box lifecycle and meta file parsing for Isolate.
//!
//! References for Isolate's CLI arguments and meta-files:
//! - https://www.ucw.cz/isolate/isolate.1.html
//! - https://github.com/ioi/isolate

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use crate::isolate::box_manager::{BoxPool, IsolateBox};
pub use crate::isolate::command::{IsolateAction, IsolateCommand, WORKSPACE_MOUNT};
pub use crate::isolate::meta::MetaFile;
pub use crate::isolate::process::{run_captured, spawn_piped};
use crate::types::MountConfig;

mod box_manager;
mod command;
mod meta;
mod process;

#[derive(Debug, Error)]
pub enum IsolateError {
    #[error("failed to initialize box {id}: {message}")]
    InitFailed { id: u32, message: String },

    #[error("failed to cleanup box {id}: {message}")]
    CleanupFailed { id: u32, message: String },

    #[error("failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("isolate did not produce a meta file: {0}")]
    MissingMeta(String),

    #[error("no available boxes in pool")]
    PoolExhausted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("mount source path does not exist: {0}")]
    MountSourceNotFound(String),

    #[error("command '{0}' not found in PATH")]
    CommandNotFound(String),
}

/// Attempt to set up the cgroup v2 hierarchy for isolate.
///
/// Without `isolate-cg-keeper` (containers), create `cg_root` and enable the
/// memory and pids controllers so per-box child cgroups work.
///
/// Returns `Ok(false)` when cgroup v2 or the memory controller is missing and
/// the caller should fall back to RLIMIT_AS.
pub fn prepare_cgroup(cg_root: &Path) -> Result<bool, IsolateError> {
    let cg_base = Path::new("/sys/fs/cgroup");

    let controllers_path = cg_base.join("cgroup.controllers");
    if !controllers_path.exists() {
        return Ok(false);
    }
    let controllers = fs::read_to_string(&controllers_path)?;
    if !has_controller(&controllers, "memory") {
        return Ok(false);
    }

    if let Ok(content) = fs::read_to_string(cg_root.join("cgroup.subtree_control"))
        && has_controller(&content, "memory")
    {
        return Ok(true);
    }

    // cgroup v2 forbids enabling controllers in a cgroup that holds processes,
    // so move ourselves into a leaf first
    let init_cg = cg_base.join("init");
    if !init_cg.exists() {
        fs::create_dir(&init_cg)?;
    }
    fs::write(init_cg.join("cgroup.procs"), std::process::id().to_string())?;
    fs::write(cg_base.join("cgroup.subtree_control"), "+memory +pids")?;

    if !cg_root.exists() {
        fs::create_dir(cg_root)?;
    }
    fs::write(cg_root.join("cgroup.subtree_control"), "+memory +pids")?;

    Ok(true)
}

fn has_controller(list: &str, name: &str) -> bool {
    list.split_whitespace().any(|c| c == name)
}

/// Check that every non-optional mount source exists on the host
pub fn validate_mounts<'a>(
    mounts: impl IntoIterator<Item = &'a MountConfig>,
) -> Result<(), IsolateError> {
    for mount in mounts {
        if !mount.optional && !Path::new(&mount.source).exists() {
            return Err(IsolateError::MountSourceNotFound(mount.source.clone()));
        }
    }
    Ok(())
}

/// Resolve a bare program name against `search_path` (a PATH-style list).
///
/// Isolate uses `execve`, which does not search PATH. Programs containing a
/// `/` are returned unchanged. Symlinks are resolved so the binary is
/// reachable inside the sandbox without crossing bind-mount boundaries.
pub fn resolve_program(program: &str, search_path: &str) -> Result<String, IsolateError> {
    if program.contains('/') {
        return Ok(program.to_string());
    }

    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| candidate.is_file())
        .map(|candidate| {
            fs::canonicalize(&candidate)
                .unwrap_or(candidate)
                .to_string_lossy()
                .into_owned()
        })
        .ok_or_else(|| IsolateError::CommandNotFound(program.to_string()))
}

/// Resolve the first element of `command` using the host's PATH
pub fn resolve_command(command: &mut [String]) -> Result<(), IsolateError> {
    if let Some(first) = command.first_mut() {
        let path_var = std::env::var("PATH").unwrap_or_default();
        *first = resolve_program(first, &path_var)?;
    }
    Ok(())
}

/// Host path for a meta file, unique per box and purpose
pub(crate) fn meta_path(sandbox: &IsolateBox, purpose: &str) -> Result<PathBuf, IsolateError> {
    sandbox.file_path(&format!("meta_{purpose}.txt"))
}
