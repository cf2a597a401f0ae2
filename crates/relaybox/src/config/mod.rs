use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::config::language::{
    CompileConfig, DEFAULT_SANDBOX_PATH, Language, LaunchStrategy, RunConfig, Toolchain,
    UnsupportedLanguage,
};
use crate::types::{MountConfig, ResourceLimits};

pub mod language;
mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../relaybox.example.toml");

/// Environment variable overriding [`Config::exec_dir`]
pub const EXEC_DIR_ENV: &str = "CODE_EXEC_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("language '{0}' not found in configuration")]
    LanguageNotFound(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which sandbox implementation launches session processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    /// IOI Isolate boxes
    #[default]
    Isolate,
    /// Plain child processes with rlimits and a process group
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxPoolConfig {
    /// First isolate box id handed out
    #[serde(default)]
    pub first_id: u32,

    /// Number of boxes, which is also the cap on concurrent sessions
    #[serde(default = "default_box_count")]
    pub count: u32,
}

impl Default for BoxPoolConfig {
    fn default() -> Self {
        Self {
            first_id: 0,
            count: default_box_count(),
        }
    }
}

/// Session timing and buffering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Time between the polite termination signal and the forced kill
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// How long to keep relaying buffered output after the child exits
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Bytes of stderr retained for the friendly error translator
    #[serde(default = "default_stderr_capture_bytes")]
    pub stderr_capture_bytes: usize,

    /// Capacity of the per-session outbound message channel
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl SessionSettings {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            kill_grace_ms: default_kill_grace_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            stderr_capture_bytes: default_stderr_capture_bytes(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// Config for Relaybox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for per-session workspaces
    #[serde(default = "default_exec_dir")]
    pub exec_dir: PathBuf,

    /// Sandbox backend used to launch session processes
    #[serde(default)]
    pub backend: SandboxKind,

    /// Accept the process backend, which leaves the host filesystem visible
    /// to submitted programs
    #[serde(default)]
    pub allow_unisolated: bool,

    /// Path to the Isolate binary (uses PATH if not specified).
    #[serde(default)]
    pub isolate_path: Option<PathBuf>,

    /// Use cgroup memory limiting instead of RLIMIT_AS.
    ///
    /// When enabled, isolate uses `--cg` and `--cg-mem` which limit actual memory
    /// usage (RSS) rather than virtual address space.
    #[serde(default)]
    pub cgroup: bool,

    /// Cgroup root path for isolate. Must match isolate's `cg_root` config value.
    #[serde(default = "default_cg_root")]
    pub cg_root: PathBuf,

    /// Directory mounts applied to every sandbox invocation
    #[serde(default)]
    pub sandbox_mounts: Vec<MountConfig>,

    #[serde(default)]
    pub box_pool: BoxPoolConfig,

    /// Resource limits applied to every session process.
    ///
    /// Limits left out of the file keep their built-in defaults.
    #[serde(default, deserialize_with = "limits_over_defaults")]
    pub default_limits: ResourceLimits,

    #[serde(default)]
    pub session: SessionSettings,

    /// Toolchains keyed by language id
    #[serde(default)]
    pub languages: HashMap<String, Toolchain>,
}

impl Config {
    /// Create a new config with embedded default languages
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty config with no languages
    pub fn empty() -> Self {
        Self {
            exec_dir: default_exec_dir(),
            backend: SandboxKind::default(),
            allow_unisolated: false,
            isolate_path: None,
            cgroup: false,
            cg_root: default_cg_root(),
            sandbox_mounts: Vec::new(),
            box_pool: BoxPoolConfig::default(),
            default_limits: ResourceLimits::default(),
            session: SessionSettings::default(),
            languages: HashMap::new(),
        }
    }

    /// Get the toolchain configured for a language
    pub fn toolchain(&self, language: Language) -> Result<&Toolchain, ConfigError> {
        self.languages
            .get(language.id())
            .ok_or_else(|| ConfigError::LanguageNotFound(language.id().to_string()))
    }

    /// Get the path to the isolate binary
    pub fn isolate_binary(&self) -> PathBuf {
        self.isolate_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("isolate"))
    }

    /// Merge resource limits with defaults
    pub fn effective_limits(&self, overrides: Option<&ResourceLimits>) -> ResourceLimits {
        match overrides {
            Some(limits) => self.default_limits.with_overrides(limits),
            None => self.default_limits.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn limits_over_defaults<'de, D>(deserializer: D) -> Result<ResourceLimits, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let limits = ResourceLimits::deserialize(deserializer)?;
    Ok(ResourceLimits::default().with_overrides(&limits))
}

fn default_exec_dir() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("code_exec_files")
}

fn default_cg_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup/isolate")
}

fn default_box_count() -> u32 {
    64
}

fn default_kill_grace_ms() -> u64 {
    500
}

fn default_drain_timeout_ms() -> u64 {
    2000
}

fn default_stderr_capture_bytes() -> usize {
    64 * 1024
}

fn default_outbound_buffer() -> usize {
    256
}
