//! Integration tests for relaybox
//!
//! Sessions run real toolchains: python3, gcc, g++ and node must be on PATH.
//! Run with: cargo test -p relaybox --features integration-tests
//!
//! Isolate tests require root and are marked `#[ignore]`. To include them:
//!    cargo test -p relaybox --features integration-tests -- --include-ignored

#![cfg(feature = "integration-tests")]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use relaybox::{
    Config, Launcher, SandboxKind, ServerMessage, SessionCoordinator, SessionOutcome,
    WorkspaceStore,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

mod config_loading;
mod isolate_sessions;
mod process_sessions;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Helper to get fixture file content
pub(crate) fn fixture_source(name: &str) -> String {
    let path = format!("{FIXTURES_PATH}/sources/{name}");
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("Failed to read fixture {path}: {e}"))
}

pub(crate) fn fixture_config(name: &str) -> PathBuf {
    PathBuf::from(format!("{FIXTURES_PATH}/configs/{name}"))
}

/// Default config on the process backend
pub(crate) fn process_config() -> Config {
    let mut config = Config::default();
    config.backend = SandboxKind::Process;
    config.allow_unisolated = true;
    config
}

/// Default config on isolate, with cgroup support if available
pub(crate) fn isolate_config() -> Config {
    let mut config = Config::default();
    config.backend = SandboxKind::Isolate;
    config.box_pool.first_id = 900;
    config.box_pool.count = 4;
    if config.cgroup {
        match relaybox::prepare_cgroup(&config.cg_root) {
            Ok(true) => {}
            _ => config.cgroup = false,
        }
    }
    config
}

/// One client connection driving a session through the coordinator
pub(crate) struct Client {
    root: tempfile::TempDir,
    inbound: Option<mpsc::Sender<String>>,
    outbound: mpsc::Receiver<ServerMessage>,
    session: JoinHandle<Option<SessionOutcome>>,
}

impl Client {
    pub(crate) fn connect(mut config: Config) -> Self {
        let root = tempfile::tempdir().expect("Failed to create workspace root");
        config.exec_dir = root.path().to_path_buf();

        let store = WorkspaceStore::new(root.path());
        let settings = config.session.clone();
        let launcher = Arc::new(Launcher::new(Arc::new(config)));
        let coordinator = SessionCoordinator::new(launcher, store, settings);

        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::channel(256);
        let session = tokio::spawn(async move { coordinator.run(in_rx, out_tx).await });

        Self {
            root,
            inbound: Some(in_tx),
            outbound: out_rx,
            session,
        }
    }

    pub(crate) fn root(&self) -> &Path {
        self.root.path()
    }

    pub(crate) async fn send(&self, message: serde_json::Value) {
        self.inbound
            .as_ref()
            .expect("client already disconnected")
            .send(message.to_string())
            .await
            .expect("session ended");
    }

    pub(crate) async fn start(&self, language: &str, code: &str) {
        self.send(serde_json::json!({"action": "start", "language": language, "code": code}))
            .await;
    }

    pub(crate) async fn input(&self, data: &str) {
        self.send(serde_json::json!({"action": "input", "data": data}))
            .await;
    }

    pub(crate) async fn next(&mut self) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(30), self.outbound.recv())
            .await
            .expect("Timed out waiting for a message")
            .expect("Session closed without a status")
    }

    /// Wait for the next prompt, returning the output seen before it
    pub(crate) async fn until_prompt(&mut self) -> (Vec<ServerMessage>, String) {
        let mut seen = Vec::new();
        loop {
            match self.next().await {
                ServerMessage::Output {
                    output,
                    prompt: true,
                } => return (seen, output),
                message @ ServerMessage::Status { .. } => {
                    panic!("session ended while waiting for a prompt: {message:?}, after {seen:?}")
                }
                message => seen.push(message),
            }
        }
    }

    /// Collect messages until the terminal status
    pub(crate) async fn until_status(&mut self) -> (Vec<ServerMessage>, ServerMessage) {
        let mut seen = Vec::new();
        loop {
            let message = self.next().await;
            if matches!(message, ServerMessage::Status { .. }) {
                return (seen, message);
            }
            seen.push(message);
        }
    }

    pub(crate) fn disconnect(&mut self) {
        self.inbound = None;
    }

    pub(crate) async fn finish(self) -> Option<SessionOutcome> {
        tokio::time::timeout(Duration::from_secs(30), self.session)
            .await
            .expect("Session did not end")
            .expect("Session task panicked")
    }
}

/// Concatenated plain output text
pub(crate) fn output_text(messages: &[ServerMessage]) -> String {
    messages
        .iter()
        .filter_map(|message| match message {
            ServerMessage::Output {
                output,
                prompt: false,
            } => Some(output.as_str()),
            _ => None,
        })
        .collect()
}

/// Session directories left under a workspace root
pub(crate) fn leftover_workspaces(root: &Path) -> usize {
    std::fs::read_dir(root).map_or(0, |entries| entries.count())
}
