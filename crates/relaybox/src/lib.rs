//! Interactive sandboxed code execution sessions.
//!
//! Relaybox runs untrusted Python, C, C++ and JavaScript programs for a
//! connected client. Each session gets its own workspace and a sandboxed
//! process whose output is relayed back as framed messages while client input
//! is forwarded to its stdin.
//!
//! # Features
//!
//! - **Sessions** driven by [`SessionCoordinator`] over plain channels, so any
//!   transport can carry them.
//! - **Sandbox backends**: IOI Isolate boxes, or rlimited process groups for
//!   development hosts.
//! - **Prompt framing**: interpreted programs run under a harness that marks
//!   reads from stdin, so clients know when input is expected.
//! - **Friendly diagnostics** explaining common compiler and runtime errors.
//! - **TOML configuration** for toolchains, limits and session timings.

pub use config::{Config, ConfigError, EXAMPLE_CONFIG, Language, SandboxKind, SessionSettings};
pub use isolate::{BoxPool, IsolateBox, IsolateError, prepare_cgroup};
pub use launcher::{Launch, LaunchError, Launcher};
pub use protocol::{ClientCommand, ProtocolError, ServerMessage, SessionOutcome};
pub use sandbox::{ChildProcess, Sandbox, SandboxError};
pub use session::{Session, SessionCoordinator, SessionState};
pub use types::{
    ErrorKind, ExecutionResult, ExecutionStatus, LimitExceeded, MountConfig, ResourceLimits,
};
pub use workspace::{Workspace, WorkspaceError, WorkspaceStore};

pub mod config;
pub mod diagnostics;
pub mod harness;
pub mod isolate;
pub mod launcher;
pub mod protocol;
pub mod relay;
pub mod sandbox;
pub mod session;
pub mod types;
pub mod workspace;
