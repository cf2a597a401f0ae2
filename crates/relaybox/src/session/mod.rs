//! Interactive sessions
//!
//! A [`Session`] owns everything one client connection created: the
//! workspace, the child process, the output relay tasks and the stdin
//! forwarder. [`SessionCoordinator`] drives it through
//! `idle -> starting -> running -> terminated`.

use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

pub use crate::session::coordinator::SessionCoordinator;
use crate::config::Language;
use crate::protocol::ServerMessage;
use crate::relay::{StreamOrigin, relay};
use crate::sandbox::ChildProcess;
use crate::types::ExecutionResult;
use crate::workspace::Workspace;

mod coordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Terminated,
}

/// What a finished teardown collected
#[derive(Debug, Default)]
pub struct Teardown {
    /// Result of the session process, if one was started
    pub result: Option<ExecutionResult>,
    /// Captured beginning of the process's stderr
    pub stderr: String,
}

/// Per-connection session state
#[derive(Debug)]
pub struct Session {
    id: String,
    language: Option<Language>,
    state: SessionState,
    workspace: Option<Workspace>,
    child: Option<ChildProcess>,
    input: Option<mpsc::UnboundedSender<String>>,
    forwarder: Option<JoinHandle<()>>,
    stdout_relay: Option<JoinHandle<String>>,
    stderr_relay: Option<JoinHandle<String>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            language: None,
            state: SessionState::Idle,
            workspace: None,
            child: None,
            input: None,
            forwarder: None,
            stdout_relay: None,
            stderr_relay: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn language(&self) -> Option<Language> {
        self.language
    }

    pub fn workspace(&self) -> Option<&Workspace> {
        self.workspace.as_ref()
    }

    /// Leave `idle`. Returns false when the session already started.
    pub(crate) fn begin(&mut self, language: Language) -> bool {
        if self.state != SessionState::Idle {
            return false;
        }
        self.language = Some(language);
        self.state = SessionState::Starting;
        true
    }

    /// Enter `running`: take over the child and start its relay tasks
    pub(crate) fn attach(
        &mut self,
        mut child: ChildProcess,
        outbound: &mpsc::Sender<ServerMessage>,
        stderr_capture: usize,
    ) {
        if let Some(stdout) = child.take_stdout() {
            self.stdout_relay = Some(tokio::spawn(forward_output(
                stdout,
                StreamOrigin::Stdout,
                outbound.clone(),
                0,
            )));
        }
        if let Some(stderr) = child.take_stderr() {
            self.stderr_relay = Some(tokio::spawn(forward_output(
                stderr,
                StreamOrigin::Stderr,
                outbound.clone(),
                stderr_capture,
            )));
        }
        if let Some(stdin) = child.take_stdin() {
            let (tx, rx) = mpsc::unbounded_channel();
            self.input = Some(tx);
            self.forwarder = Some(tokio::spawn(forward_input(stdin, rx)));
        }

        self.child = Some(child);
        self.state = SessionState::Running;
    }

    /// Queue one line for the child's stdin. Ignored once stdin is closed.
    pub(crate) fn send_input(&self, line: String) {
        if let Some(input) = &self.input
            && input.send(line).is_err()
        {
            debug!("stdin closed, dropping input");
        }
    }

    /// Stop everything the session owns and remove its files.
    ///
    /// The child is signalled, then killed after `grace`. With `drain` set the
    /// relays get until then to forward buffered output, otherwise they are
    /// cancelled. Calling this again is a no-op.
    pub async fn teardown(&mut self, grace: Duration, drain: Option<Duration>) -> Teardown {
        if self.state == SessionState::Terminated {
            return Teardown::default();
        }
        self.state = SessionState::Terminated;

        self.input = None;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }

        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.terminate(grace).await {
                warn!(session_id = %self.id, error = %e, "failed to terminate session process");
            }
            child.kill_group();
        }

        let deadline = drain.map(|timeout| tokio::time::Instant::now() + timeout);
        collect_relay(self.stdout_relay.take(), deadline).await;
        let stderr = collect_relay(self.stderr_relay.take(), deadline).await;

        let result = match self.child.take() {
            Some(child) => Some(child.finish().await),
            None => None,
        };

        if let Some(workspace) = self.workspace.as_mut()
            && let Err(e) = workspace.release().await
        {
            warn!(session_id = %self.id, error = %e, "failed to release workspace");
        }

        debug!(session_id = %self.id, "session torn down");
        Teardown { result, stderr }
    }
}

/// Wait for a relay until `deadline`, or cancel it right away without one
async fn collect_relay(
    relay: Option<JoinHandle<String>>,
    deadline: Option<tokio::time::Instant>,
) -> String {
    let Some(mut relay) = relay else {
        return String::new();
    };
    let Some(deadline) = deadline else {
        relay.abort();
        return String::new();
    };

    match tokio::time::timeout_at(deadline, &mut relay).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            debug!(error = %e, "relay task ended abnormally");
            String::new()
        }
        Err(_) => {
            debug!("relay did not drain in time, cancelling");
            relay.abort();
            String::new()
        }
    }
}

/// Relay one output stream to the client.
///
/// Returns up to `capture` bytes of the forwarded text.
async fn forward_output<R>(
    reader: R,
    origin: StreamOrigin,
    outbound: mpsc::Sender<ServerMessage>,
    capture: usize,
) -> String
where
    R: AsyncRead + Unpin + Send,
{
    let mut captured = String::new();
    let frames = relay(reader, origin);
    tokio::pin!(frames);

    while let Some(frame) = frames.next().await {
        let message = match frame {
            Ok(frame) => {
                if captured.len() < capture && !frame.is_prompt() {
                    let room = capture - captured.len();
                    captured.push_str(truncate(&frame.data, room));
                }
                ServerMessage::from(frame)
            }
            Err(e) => {
                warn!(stream = origin.as_str(), error = %e, "failed to read process output");
                ServerMessage::error(format!("Failed to read {}: {e}", origin.as_str()))
            }
        };
        if outbound.send(message).await.is_err() {
            debug!(stream = origin.as_str(), "client gone, stopping relay");
            break;
        }
    }
    captured
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Write queued lines to the child's stdin, each followed by a newline
async fn forward_input(mut stdin: ChildStdin, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lines.recv().await {
        let mut data = line.into_bytes();
        data.push(b'\n');
        let written = async {
            stdin.write_all(&data).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            debug!(error = %e, "stdin write failed, closing stdin");
            break;
        }
    }
}
