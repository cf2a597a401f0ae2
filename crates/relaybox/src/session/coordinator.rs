use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{Span, debug, field, info, instrument, warn};

use crate::config::{Language, SessionSettings};
use crate::diagnostics;
use crate::launcher::{Launch, LaunchError};
use crate::protocol::{ClientCommand, ProtocolError, ServerMessage, SessionOutcome, parse_client_message};
use crate::session::{Session, Teardown};
use crate::types::{ErrorKind, ExecutionResult, LimitExceeded};
use crate::workspace::WorkspaceStore;

/// Why the running phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    Exited,
    Stopped,
    Timeout,
    Disconnected,
}

enum Inbound {
    Command(ClientCommand),
    Invalid(ProtocolError),
    Closed,
}

impl From<Option<String>> for Inbound {
    fn from(message: Option<String>) -> Self {
        match message {
            None => Inbound::Closed,
            Some(text) => match parse_client_message(&text) {
                Ok(command) => Inbound::Command(command),
                Err(e) => Inbound::Invalid(e),
            },
        }
    }
}

enum Launched<T> {
    Done(T),
    Aborted(EndReason),
}

/// Runs interactive sessions.
///
/// One coordinator is shared by all connections; each call to
/// [`run`](Self::run) drives one independent session.
#[derive(Debug)]
pub struct SessionCoordinator<L> {
    launcher: Arc<L>,
    store: WorkspaceStore,
    settings: SessionSettings,
}

impl<L: Launch> SessionCoordinator<L> {
    pub fn new(launcher: Arc<L>, store: WorkspaceStore, settings: SessionSettings) -> Self {
        Self {
            launcher,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Drive one session until it ends.
    ///
    /// `inbound` carries raw client text messages and closes when the client
    /// disconnects. Returns the outcome reported to the client, or `None`
    /// when the client went away first.
    #[instrument(skip_all, fields(session_id = field::Empty, language = field::Empty))]
    pub async fn run(
        &self,
        mut inbound: mpsc::Receiver<String>,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Option<SessionOutcome> {
        let mut session = Session::new();
        Span::current().record("session_id", session.id());

        let (language, code) = loop {
            match Inbound::from(inbound.recv().await) {
                Inbound::Closed => {
                    session.teardown(self.settings.kill_grace(), None).await;
                    return None;
                }
                Inbound::Invalid(e) => reject(&outbound, e).await,
                Inbound::Command(ClientCommand::Input { .. }) => {
                    debug!("input before start, ignoring");
                }
                Inbound::Command(ClientCommand::Stop) => {
                    session.teardown(self.settings.kill_grace(), None).await;
                    send(&outbound, status(SessionOutcome::Stopped, None, None)).await;
                    return Some(SessionOutcome::Stopped);
                }
                Inbound::Command(ClientCommand::Start { language, code }) => {
                    match language.parse::<Language>() {
                        Ok(language) => break (language, code),
                        Err(_) => {
                            info!(requested = %language, "unsupported language");
                            session.teardown(self.settings.kill_grace(), None).await;
                            send(&outbound, ServerMessage::error("Unsupported language.")).await;
                            return self.finish_early(&outbound).await;
                        }
                    }
                }
            }
        };

        Span::current().record("language", language.id());
        session.begin(language);
        self.start(&mut session, language, &code, &mut inbound, &outbound)
            .await
    }

    async fn finish_early(&self, outbound: &mpsc::Sender<ServerMessage>) -> Option<SessionOutcome> {
        send(outbound, status(SessionOutcome::Error, None, None)).await;
        Some(SessionOutcome::Error)
    }

    /// `starting`: materialize the workspace and launch, then run
    async fn start(
        &self,
        session: &mut Session,
        language: Language,
        code: &str,
        inbound: &mut mpsc::Receiver<String>,
        outbound: &mpsc::Sender<ServerMessage>,
    ) -> Option<SessionOutcome> {
        let workspace = match self.store.allocate(code, language).await {
            Ok(workspace) => workspace,
            Err(e) => {
                warn!(error = %e, "failed to allocate workspace");
                session.teardown(self.settings.kill_grace(), None).await;
                send(outbound, ServerMessage::error(e.to_string())).await;
                return self.finish_early(outbound).await;
            }
        };
        let workspace = session.workspace.insert(workspace);

        // Inputs that arrive while compiling are replayed once running
        let mut pending = Vec::new();
        let launched = {
            let launch = self.launcher.launch(language, workspace);
            tokio::pin!(launch);
            loop {
                tokio::select! {
                    result = &mut launch => break Launched::Done(result),
                    message = inbound.recv() => match Inbound::from(message) {
                        Inbound::Closed => break Launched::Aborted(EndReason::Disconnected),
                        Inbound::Command(ClientCommand::Stop) => {
                            break Launched::Aborted(EndReason::Stopped);
                        }
                        Inbound::Command(ClientCommand::Input { data }) => pending.push(data),
                        Inbound::Command(ClientCommand::Start { .. }) => {
                            send(outbound, ServerMessage::error("Session already started.")).await;
                        }
                        Inbound::Invalid(e) => reject(outbound, e).await,
                    },
                }
            }
        };

        let child = match launched {
            Launched::Done(Ok(child)) => child,
            Launched::Done(Err(e)) => {
                session.teardown(self.settings.kill_grace(), None).await;
                send(outbound, launch_error_message(language, code, &e)).await;
                return self.finish_early(outbound).await;
            }
            Launched::Aborted(reason) => {
                debug!(?reason, "session ended while starting");
                session.teardown(self.settings.kill_grace(), None).await;
                if reason == EndReason::Disconnected {
                    return None;
                }
                send(outbound, status(SessionOutcome::Stopped, None, None)).await;
                return Some(SessionOutcome::Stopped);
            }
        };

        // The backend's own wall clock is authoritative when it has one
        let wall_clock = self.launcher.wall_clock(language);
        let timer = if child.enforces_wall_clock() {
            None
        } else {
            wall_clock
        };

        session.attach(child, outbound, self.settings.stderr_capture_bytes);
        info!("session running");
        for line in pending {
            session.send_input(line);
        }

        let reason = self.run_until_end(session, timer, inbound, outbound).await;
        info!(?reason, "session ending");

        let drain = match reason {
            EndReason::Disconnected => None,
            _ => Some(self.settings.drain_timeout()),
        };
        let teardown = session.teardown(self.settings.kill_grace(), drain).await;
        if reason == EndReason::Disconnected {
            return None;
        }

        let (outcome, message) = final_status(language, code, reason, teardown, wall_clock);
        send(outbound, message).await;
        Some(outcome)
    }

    /// `running`: forward input until the child exits, the client stops or
    /// leaves, or the wall clock runs out
    async fn run_until_end(
        &self,
        session: &mut Session,
        timer: Option<Duration>,
        inbound: &mut mpsc::Receiver<String>,
        outbound: &mpsc::Sender<ServerMessage>,
    ) -> EndReason {
        let deadline = async {
            match timer {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            let Some(child) = session.child.as_mut() else {
                return EndReason::Exited;
            };
            tokio::select! {
                status = child.wait() => {
                    debug!(?status, "session process exited");
                    return EndReason::Exited;
                }
                () = &mut deadline => {
                    info!("wall clock limit reached");
                    return EndReason::Timeout;
                }
                message = inbound.recv() => match Inbound::from(message) {
                    Inbound::Closed => return EndReason::Disconnected,
                    Inbound::Command(ClientCommand::Stop) => return EndReason::Stopped,
                    Inbound::Command(ClientCommand::Input { data }) => session.send_input(data),
                    Inbound::Command(ClientCommand::Start { .. }) => {
                        send(outbound, ServerMessage::error("Session already started.")).await;
                    }
                    Inbound::Invalid(e) => reject(outbound, e).await,
                },
            }
        }
    }
}

async fn send(outbound: &mpsc::Sender<ServerMessage>, message: ServerMessage) {
    if outbound.send(message).await.is_err() {
        debug!("client gone, dropping message");
    }
}

async fn reject(outbound: &mpsc::Sender<ServerMessage>, error: ProtocolError) {
    debug!(kind = %error.kind(), %error, "rejected client message");
    send(outbound, error.into()).await;
}

/// Error category of a session that ran and did not succeed
fn failure_kind(outcome: SessionOutcome) -> Option<ErrorKind> {
    match outcome {
        SessionOutcome::Error => Some(ErrorKind::RuntimeError),
        SessionOutcome::Timeout => Some(ErrorKind::Timeout),
        SessionOutcome::Success | SessionOutcome::Stopped => None,
    }
}

fn status(
    outcome: SessionOutcome,
    result: Option<&ExecutionResult>,
    friendly_error: Option<String>,
) -> ServerMessage {
    ServerMessage::Status {
        status: outcome,
        exit_code: result.and_then(|r| r.exit_code),
        execution_time: result.map_or(0.0, |r| r.wall_time),
        friendly_error,
    }
}

fn launch_error_message(language: Language, code: &str, error: &LaunchError) -> ServerMessage {
    match error {
        LaunchError::Unsupported(_) => ServerMessage::error("Unsupported language."),
        LaunchError::Compile { .. } => {
            let detail = error.detail();
            ServerMessage::Error {
                friendly_error: Some(diagnostics::explain(language, code, &detail)),
                error: detail,
            }
        }
        other => {
            warn!(kind = %other.kind(), error = %other, "failed to launch session process");
            ServerMessage::error(other.detail())
        }
    }
}

/// Map how the session ended to the terminal status message
fn final_status(
    language: Language,
    code: &str,
    reason: EndReason,
    teardown: Teardown,
    wall_clock: Option<Duration>,
) -> (SessionOutcome, ServerMessage) {
    let result = teardown.result.unwrap_or_default();
    let timed_out = reason == EndReason::Timeout || result.limit_exceeded.is_timeout();

    let (outcome, friendly) = if timed_out {
        let limit = wall_clock.unwrap_or(Duration::from_secs(10));
        (SessionOutcome::Timeout, Some(diagnostics::timeout_message(limit)))
    } else if reason == EndReason::Stopped {
        (SessionOutcome::Stopped, None)
    } else if result.is_success() {
        (SessionOutcome::Success, None)
    } else {
        (SessionOutcome::Error, failure_message(language, code, &teardown.stderr, &result))
    };

    if let Some(kind) = failure_kind(outcome) {
        info!(%kind, exit_code = ?result.exit_code, signal = ?result.signal, "session failed");
    }
    let message = status(outcome, Some(&result), friendly);
    (outcome, message)
}

fn failure_message(
    language: Language,
    code: &str,
    stderr: &str,
    result: &ExecutionResult,
) -> Option<String> {
    if !stderr.trim().is_empty() {
        return Some(diagnostics::explain(language, code, stderr.trim()));
    }
    match result.limit_exceeded {
        LimitExceeded::Memory => Some("Your program used more memory than allowed.".to_string()),
        LimitExceeded::Output => Some("Your program wrote more output than allowed.".to_string()),
        _ => match (result.signal, &result.message) {
            (_, Some(message)) => Some(message.clone()),
            (Some(signal), None) => Some(format!("Your program was killed by signal {signal}.")),
            (None, None) => None,
        },
    }
}
