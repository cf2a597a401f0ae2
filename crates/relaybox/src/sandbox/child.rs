//! A running sandboxed session process

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tracing::{debug, warn};

use crate::isolate::{IsolateBox, MetaFile};
use crate::sandbox::process::local_result;
use crate::types::ExecutionResult;

#[derive(Debug)]
enum ChildBackend {
    Isolate { sandbox: IsolateBox, meta: PathBuf },
    Process,
}

/// Handle to the session process.
///
/// The process runs in its own process group, so termination reaches every
/// descendant. Call [`finish`](Self::finish) once the process has ended to
/// collect its result and release sandbox resources.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    exit: Option<ExitStatus>,
    pid: Option<u32>,
    started: Instant,
    backend: ChildBackend,
}

impl ChildProcess {
    pub(crate) fn isolated(child: Child, sandbox: IsolateBox, meta: PathBuf) -> Self {
        Self::new(child, ChildBackend::Isolate { sandbox, meta })
    }

    pub(crate) fn local(child: Child) -> Self {
        Self::new(child, ChildBackend::Process)
    }

    fn new(mut child: Child, backend: ChildBackend) -> Self {
        Self {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            pid: child.id(),
            child,
            exit: None,
            started: Instant::now(),
            backend,
        }
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// OS pid of the process group leader, if it is still running
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether the backend kills the process when the wall clock runs out
    pub fn enforces_wall_clock(&self) -> bool {
        matches!(self.backend, ChildBackend::Isolate { .. })
    }

    /// Take the write end of the process's stdin
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Close stdin so the program sees end of input
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Wait for the process to exit. Cancel safe.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit = Some(status);
        Ok(status)
    }

    /// Stop the whole process group.
    ///
    /// Sends SIGTERM, waits up to `grace` and then sends SIGKILL.
    pub async fn terminate(&mut self, grace: Duration) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            self.exit = Some(status);
            return Ok(status);
        }

        self.close_stdin();
        let Some(pid) = self.child.id() else {
            return self.wait().await;
        };

        signal_group(pid, libc::SIGTERM);
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(status) => status,
            Err(_) => {
                debug!(pid, "process group ignored SIGTERM, sending SIGKILL");
                signal_group(pid, libc::SIGKILL);
                self.wait().await
            }
        }
    }

    /// SIGKILL whatever is left of the process group once the leader exited
    pub fn kill_group(&self) {
        if self.exit.is_some()
            && let Some(pid) = self.pid
        {
            signal_group(pid, libc::SIGKILL);
        }
    }

    /// Collect the result of the ended process and release its sandbox
    pub async fn finish(mut self) -> ExecutionResult {
        let status = self.wait().await;
        let elapsed = self.started.elapsed().as_secs_f64();

        let mut result = match &mut self.backend {
            ChildBackend::Isolate { sandbox, meta } => {
                let result = match MetaFile::load(meta).await {
                    Ok(meta) => meta.to_execution_result(),
                    Err(e) => {
                        debug!(error = %e, "no meta file, using exit status");
                        exit_result(status)
                    }
                };
                if let Err(e) = sandbox.cleanup().await {
                    warn!(box_id = sandbox.id(), error = %e, "failed to clean up isolate box");
                }
                result
            }
            ChildBackend::Process => exit_result(status),
        };

        if result.wall_time <= 0.0 {
            result.wall_time = elapsed;
        }
        result
    }
}

fn exit_result(status: std::io::Result<ExitStatus>) -> ExecutionResult {
    match status {
        Ok(status) => local_result(status),
        Err(e) => ExecutionResult {
            status: crate::types::ExecutionStatus::InternalError,
            message: Some(format!("failed to wait for process: {e}")),
            ..Default::default()
        },
    }
}

fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill has no memory safety preconditions
    let ret = unsafe { libc::kill(-pid, signal) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, signal, error = %err, "failed to signal process group");
        }
    }
}
