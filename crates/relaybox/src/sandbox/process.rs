//! Direct process backend.
//!
//! Runs the program as a plain child in its own process group with a cleared
//! environment, the workspace as working directory and rlimits applied
//! between fork and exec. There is no filesystem isolation and no wall-clock
//! ceiling here; the session enforces the wall clock itself.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use tokio::process::{Child, Command};
use tracing::debug;

use crate::sandbox::{SandboxCommand, SandboxError};
use crate::types::{ExecutionResult, ExecutionStatus, LimitExceeded, ResourceLimits};

/// rlimits applied in the child before exec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Rlimits {
    cpu_secs: Option<u64>,
    address_space: Option<u64>,
    file_size: Option<u64>,
    stack: Option<u64>,
    open_files: Option<u64>,
}

impl Rlimits {
    pub(crate) fn from_limits(limits: &ResourceLimits) -> Self {
        let kb = |value: u64| value.saturating_mul(1024);
        let cpu = limits
            .time_limit
            .map(|secs| secs + limits.extra_time.unwrap_or(0.0))
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(|secs| secs.ceil() as u64);

        Self {
            cpu_secs: cpu,
            address_space: limits.memory_limit.map(kb),
            file_size: limits.max_output.map(kb),
            stack: limits.stack_limit.map(kb),
            open_files: limits.max_open_files.map(u64::from),
        }
    }

    /// Apply the limits to the calling process.
    ///
    /// Runs between fork and exec, so it only makes raw syscalls.
    fn apply(&self) -> io::Result<()> {
        // SIGXCPU at the soft limit, SIGKILL one second later
        if let Some(secs) = self.cpu_secs {
            check(unsafe { libc::setrlimit(libc::RLIMIT_CPU, &rlimit(secs, secs + 1)) })?;
        }
        if let Some(bytes) = self.address_space {
            check(unsafe { libc::setrlimit(libc::RLIMIT_AS, &rlimit(bytes, bytes)) })?;
        }
        if let Some(bytes) = self.file_size {
            check(unsafe { libc::setrlimit(libc::RLIMIT_FSIZE, &rlimit(bytes, bytes)) })?;
        }
        if let Some(bytes) = self.stack {
            check(unsafe { libc::setrlimit(libc::RLIMIT_STACK, &rlimit(bytes, bytes)) })?;
        }
        if let Some(count) = self.open_files {
            check(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlimit(count, count)) })?;
        }
        Ok(())
    }
}

fn rlimit(soft: u64, hard: u64) -> libc::rlimit {
    libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    }
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn build(command: &SandboxCommand, workspace_dir: &Path) -> Result<Command, SandboxError> {
    let (program, args) = command
        .argv
        .split_first()
        .ok_or(SandboxError::EmptyCommand)?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .env("PATH", &command.path)
        .env("HOME", workspace_dir)
        .envs(&command.env)
        .current_dir(workspace_dir)
        .process_group(0)
        .kill_on_drop(true);

    let rlimits = Rlimits::from_limits(&command.limits);
    // SAFETY: the closure only calls setrlimit, which is async-signal-safe
    unsafe {
        cmd.pre_exec(move || rlimits.apply());
    }

    Ok(cmd)
}

/// Spawn the session process with piped stdio
pub(crate) fn spawn(command: SandboxCommand, workspace_dir: &Path) -> Result<Child, SandboxError> {
    let mut cmd = build(&command, workspace_dir)?;
    debug!(argv = ?command.argv, "spawning local process");

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| SandboxError::Spawn {
            program: command.argv[0].clone(),
            source,
        })
}

/// Run to completion, bounded by the command's wall clock limit
pub(crate) async fn run_captured(
    command: SandboxCommand,
    workspace_dir: &Path,
) -> Result<(ExecutionResult, String), SandboxError> {
    let mut cmd = build(&command, workspace_dir)?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let started = Instant::now();
    let output = cmd.output();
    let output = match command.limits.wall_clock() {
        // Dropping the output future kills the child (kill_on_drop)
        Some(limit) => match tokio::time::timeout(limit, output).await {
            Ok(output) => output,
            Err(_) => {
                let result = ExecutionResult {
                    status: ExecutionStatus::TimeLimitExceeded,
                    limit_exceeded: LimitExceeded::WallTime,
                    wall_time: started.elapsed().as_secs_f64(),
                    message: Some("Time limit exceeded (wall clock)".to_string()),
                    ..Default::default()
                };
                return Ok((result, String::new()));
            }
        },
        None => output.await,
    }
    .map_err(|source| SandboxError::Spawn {
        program: command.argv[0].clone(),
        source,
    })?;

    let mut result = local_result(output.status);
    result.wall_time = started.elapsed().as_secs_f64();

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !combined.is_empty() && !stderr.is_empty() && !combined.ends_with('\n') {
        combined.push('\n');
    }
    combined.push_str(&stderr);

    Ok((result, combined))
}

/// Map an exit status, treating SIGXCPU as a CPU time overrun
pub(crate) fn local_result(status: std::process::ExitStatus) -> ExecutionResult {
    let mut result = ExecutionResult::from_exit_status(status);
    if result.signal == Some(libc::SIGXCPU) {
        result.status = ExecutionStatus::TimeLimitExceeded;
        result.limit_exceeded = LimitExceeded::Time;
    }
    result
}
