//! Running commands inside an Isolate box
//!
//! Both entry points talk to the sandboxed program over pipes. Results come
//! from the meta file isolate writes once the program has ended.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, instrument};

use crate::isolate::box_manager::IsolateBox;
use crate::isolate::command::IsolateCommand;
use crate::isolate::meta::MetaFile;
use crate::isolate::{IsolateError, meta_path};
use crate::types::ExecutionResult;

/// Run a command to completion and capture its combined output.
///
/// Used for compilation: stdout and stderr are joined with a newline.
#[instrument(skip(sandbox, command), fields(box_id = sandbox.id()))]
pub async fn run_captured(
    sandbox: &IsolateBox,
    command: IsolateCommand,
) -> Result<(ExecutionResult, String), IsolateError> {
    let meta = meta_path(sandbox, "compile")?;
    remove_stale(&meta).await?;

    let args = command.meta_file(&meta).build();
    debug!(?args, "running isolate command");

    let output = Command::new(&args[0])
        .args(&args[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| IsolateError::SpawnFailed {
            program: args[0].clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !meta.exists() {
        return Err(IsolateError::MissingMeta(stderr.trim().to_string()));
    }
    let result = MetaFile::load(&meta).await?.to_execution_result();

    let mut combined = stdout.into_owned();
    if !combined.is_empty() && !stderr.is_empty() && !combined.ends_with('\n') {
        combined.push('\n');
    }
    combined.push_str(&stderr);

    debug!(status = ?result.status, exit_code = ?result.exit_code, "isolate command finished");
    Ok((result, combined))
}

/// Spawn a command with piped stdio in its own process group.
///
/// Returns the isolate child and the host path of the meta file it will write.
#[instrument(skip(sandbox, command), fields(box_id = sandbox.id()))]
pub async fn spawn_piped(
    sandbox: &IsolateBox,
    command: IsolateCommand,
) -> Result<(Child, PathBuf), IsolateError> {
    let meta = meta_path(sandbox, "run")?;
    remove_stale(&meta).await?;

    let args = command.meta_file(&meta).build();
    debug!(?args, "spawning interactive isolate process");

    let child = Command::new(&args[0])
        .args(&args[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| IsolateError::SpawnFailed {
            program: args[0].clone(),
            source,
        })?;

    Ok((child, meta))
}

async fn remove_stale(path: &Path) -> Result<(), IsolateError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
