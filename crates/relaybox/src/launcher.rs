//! Turning a session workspace into a running process
//!
//! Interpreted languages start the interpreter on a harness that wraps the
//! submitted source. Compiled languages are built inside the sandbox first and
//! the resulting binary is started with piped stdio.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::{CompileConfig, Config, Language, LaunchStrategy, Toolchain};
use crate::harness;
use crate::sandbox::{ChildProcess, Sandbox, SandboxCommand, SandboxError, SandboxSlot};
use crate::types::{ErrorKind, ExecutionResult, ResourceLimits};
use crate::workspace::{Workspace, WorkspaceError};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("unsupported language: {0}")]
    Unsupported(String),

    #[error("compilation failed")]
    Compile {
        /// Combined compiler output
        output: String,
        result: ExecutionResult,
    },

    #[error("language {0} has no compile step configured")]
    MissingCompileStep(Language),

    #[error("failed to start sandbox: {0}")]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

impl LaunchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LaunchError::Unsupported(_) => ErrorKind::UnsupportedLanguage,
            LaunchError::Compile { .. } => ErrorKind::CompileError,
            LaunchError::MissingCompileStep(_)
            | LaunchError::Sandbox(_)
            | LaunchError::Workspace(_) => ErrorKind::LaunchFailure,
        }
    }

    /// Diagnostic shown to the client
    pub fn detail(&self) -> String {
        match self {
            LaunchError::Compile { output, result } => {
                let output = output.trim_end();
                if !output.is_empty() {
                    output.to_string()
                } else if let Some(message) = &result.message {
                    message.clone()
                } else {
                    format!("compilation failed with status {:?}", result.status)
                }
            }
            other => other.to_string(),
        }
    }
}

/// Starts session processes
pub trait Launch: Send + Sync {
    /// Start the program held by `workspace`. Files created along the way are
    /// tracked by the workspace.
    fn launch(
        &self,
        language: Language,
        workspace: &mut Workspace,
    ) -> impl Future<Output = Result<ChildProcess, LaunchError>> + Send;

    /// Wall clock ceiling for a session in `language`
    fn wall_clock(&self, language: Language) -> Option<Duration>;
}

/// Default compilation limits
fn default_compile_limits() -> ResourceLimits {
    ResourceLimits {
        time_limit: Some(30.0),
        wall_time_limit: Some(60.0),
        memory_limit: Some(512 * ResourceLimits::MB),
        max_processes: Some(10),
        max_output: Some(64 * ResourceLimits::MB),
        ..Default::default()
    }
}

/// Linker flags implied by the headers a C or C++ source includes
pub fn link_flags(language: Language, code: &str) -> Vec<&'static str> {
    let mut flags = Vec::new();
    if !language.is_compiled() {
        return flags;
    }
    if code.contains("pthread.h") {
        flags.push("-lpthread");
    }
    let uses_time = code.contains("time.h") || (language == Language::Cpp && code.contains("ctime"));
    if uses_time {
        flags.push("-lrt");
    }
    flags
}

/// Launches sessions with the configured toolchains and sandbox backend
#[derive(Debug, Clone)]
pub struct Launcher {
    config: Arc<Config>,
    sandbox: Sandbox,
}

impl Launcher {
    pub fn new(config: Arc<Config>) -> Self {
        let sandbox = Sandbox::from_config(&config);
        Self { config, sandbox }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    fn run_command(&self, toolchain: &Toolchain, argv: Vec<String>) -> SandboxCommand {
        SandboxCommand {
            argv,
            env: toolchain.run.env.clone(),
            path: toolchain.run.path.clone(),
            limits: self.config.effective_limits(toolchain.run.limits.as_ref()),
            mounts: toolchain.run.mounts.clone(),
        }
    }

    /// Write the harness and return the interpreter command line
    async fn prepare_interpreted(
        &self,
        language: Language,
        toolchain: &Toolchain,
        workspace: &mut Workspace,
        slot: &SandboxSlot,
    ) -> Result<Vec<String>, LaunchError> {
        let source = slot.guest_path(workspace.source_name());
        let rendered = harness::render(language, &source)
            .ok_or_else(|| LaunchError::Unsupported(language.id().to_string()))?;

        let name = harness::file_name(language, workspace.token());
        workspace.write_file(&name, rendered.as_bytes()).await?;

        Ok(Toolchain::expand_command(
            &toolchain.run.command,
            &slot.guest_path(&name),
            "",
        ))
    }

    /// Compile in the slot and return the command line of the binary
    #[instrument(skip_all, fields(%language))]
    async fn prepare_compiled(
        &self,
        language: Language,
        toolchain: &Toolchain,
        compile: &CompileConfig,
        workspace: &mut Workspace,
        slot: &SandboxSlot,
    ) -> Result<Vec<String>, LaunchError> {
        workspace.track(&compile.output_name)?;
        let source = slot.guest_path(workspace.source_name());
        let binary = slot.guest_path(&compile.output_name);

        let code = tokio::fs::read_to_string(workspace.source_path())
            .await
            .unwrap_or_default();
        let mut argv = Toolchain::expand_command(&compile.command, &source, &binary);
        if let Some(unit) = harness::stdio_unit(language) {
            let name = harness::stdio_file_name(workspace.token());
            workspace.write_file(&name, unit.as_bytes()).await?;
            argv.push(slot.guest_path(&name));
        }
        argv.extend(link_flags(language, &code).into_iter().map(String::from));

        let limits = match &compile.limits {
            Some(limits) => default_compile_limits().with_overrides(limits),
            None => default_compile_limits(),
        };
        let command = SandboxCommand {
            argv,
            env: compile.env.clone(),
            path: toolchain.run.path.clone(),
            limits,
            mounts: Vec::new(),
        };

        let (result, output) = slot.run_to_completion(command).await?;
        debug!(
            exit_code = ?result.exit_code,
            status = ?result.status,
            "compilation complete"
        );
        if !result.is_success() {
            return Err(LaunchError::Compile { output, result });
        }

        Ok(Toolchain::expand_command(
            &toolchain.run.command,
            &source,
            &binary,
        ))
    }
}

impl Launch for Launcher {
    #[instrument(skip(self, workspace), fields(%language, dir = %workspace.dir().display()))]
    async fn launch(
        &self,
        language: Language,
        workspace: &mut Workspace,
    ) -> Result<ChildProcess, LaunchError> {
        let toolchain = self
            .config
            .toolchain(language)
            .map_err(|_| LaunchError::Unsupported(language.id().to_string()))?;

        let slot = self.sandbox.open(workspace).await?;
        let prepared = match language.strategy() {
            LaunchStrategy::Interpret => {
                self.prepare_interpreted(language, toolchain, workspace, &slot)
                    .await
            }
            LaunchStrategy::CompileThenRun => match &toolchain.compile {
                Some(compile) => {
                    self.prepare_compiled(language, toolchain, compile, workspace, &slot)
                        .await
                }
                None => Err(LaunchError::MissingCompileStep(language)),
            },
        };

        let argv = match prepared {
            Ok(argv) => argv,
            Err(e) => {
                slot.close().await;
                return Err(e);
            }
        };

        let command = self.run_command(toolchain, argv);
        debug!(argv = ?command.argv, "starting session process");
        Ok(slot.spawn(command).await?)
    }

    fn wall_clock(&self, language: Language) -> Option<Duration> {
        let overrides = self
            .config
            .toolchain(language)
            .ok()
            .and_then(|toolchain| toolchain.run.limits.as_ref());
        self.config.effective_limits(overrides).wall_clock()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::config::{DEFAULT_SANDBOX_PATH, RunConfig, SandboxKind};
    use crate::workspace::WorkspaceStore;

    fn toolchain(compile: Option<Vec<&str>>, run: Vec<&str>) -> Toolchain {
        let strings = |argv: Vec<&str>| argv.into_iter().map(String::from).collect();
        Toolchain {
            name: "test".to_string(),
            compile: compile.map(|command| CompileConfig {
                command: strings(command),
                output_name: "program".to_string(),
                env: HashMap::new(),
                limits: None,
            }),
            run: RunConfig {
                command: strings(run),
                env: HashMap::new(),
                mounts: Vec::new(),
                path: DEFAULT_SANDBOX_PATH.to_string(),
                limits: None,
            },
        }
    }

    fn launcher(languages: Vec<(Language, Toolchain)>) -> Launcher {
        let mut config = Config::empty();
        config.backend = SandboxKind::Process;
        for (language, toolchain) in languages {
            config.languages.insert(language.id().to_string(), toolchain);
        }
        Launcher::new(Arc::new(config))
    }

    async fn read_all(child: &mut ChildProcess) -> String {
        let mut out = String::new();
        child
            .take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        out
    }

    #[test]
    fn link_flags_follow_includes() {
        assert!(link_flags(Language::C, "#include <stdio.h>").is_empty());
        assert_eq!(
            link_flags(Language::C, "#include <pthread.h>\n#include <sys/time.h>"),
            vec!["-lpthread", "-lrt"]
        );
        assert_eq!(link_flags(Language::Cpp, "#include <ctime>"), vec!["-lrt"]);
        assert!(link_flags(Language::C, "#include <ctime>").is_empty());
        assert!(link_flags(Language::Python, "import time.h").is_empty());
    }

    #[test]
    fn launch_error_kinds() {
        assert_eq!(
            LaunchError::Unsupported("ruby".into()).kind(),
            ErrorKind::UnsupportedLanguage
        );
        let compile = LaunchError::Compile {
            output: "x.c:1: error\n".into(),
            result: ExecutionResult::default(),
        };
        assert_eq!(compile.kind(), ErrorKind::CompileError);
        assert_eq!(compile.detail(), "x.c:1: error");
        assert_eq!(
            LaunchError::Sandbox(SandboxError::EmptyCommand).kind(),
            ErrorKind::LaunchFailure
        );
    }

    #[test]
    fn compile_error_detail_falls_back_to_message() {
        let error = LaunchError::Compile {
            output: String::new(),
            result: ExecutionResult {
                message: Some("Time limit exceeded".into()),
                ..Default::default()
            },
        };
        assert_eq!(error.detail(), "Time limit exceeded");
    }

    #[test]
    fn wall_clock_uses_run_overrides() {
        let mut slow = toolchain(None, vec!["/bin/cat", "{source}"]);
        slow.run.limits = Some(ResourceLimits::unset().with_wall_time_limit(3.0));
        let launcher = launcher(vec![(Language::Python, slow)]);

        assert_eq!(
            launcher.wall_clock(Language::Python),
            Some(Duration::from_secs(3))
        );
        assert_eq!(
            launcher.wall_clock(Language::C),
            Some(Duration::from_secs(10))
        );
    }

    #[tokio::test]
    async fn interpreted_runs_harness() {
        let root = tempfile::tempdir().unwrap();
        let launcher = launcher(vec![(
            Language::Python,
            toolchain(None, vec!["/bin/cat", "{source}"]),
        )]);
        let mut workspace = WorkspaceStore::new(root.path())
            .allocate("print(1)", Language::Python)
            .await
            .unwrap();

        let mut child = launcher
            .launch(Language::Python, &mut workspace)
            .await
            .unwrap();
        let harness = read_all(&mut child).await;
        assert!(child.finish().await.is_success());

        let source = workspace.source_path().to_string_lossy().into_owned();
        assert!(harness.contains(&source));
        assert_eq!(workspace.files().len(), 2);

        workspace.release().await.unwrap();
    }

    #[tokio::test]
    async fn compiled_runs_binary() {
        let root = tempfile::tempdir().unwrap();
        let launcher = launcher(vec![(
            Language::C,
            toolchain(
                Some(vec!["/bin/sh", "-c", "cp \"$0\" \"$1\" && chmod +x \"$1\"", "{source}", "{output}"]),
                vec!["{binary}", "arg"],
            ),
        )]);
        let mut workspace = WorkspaceStore::new(root.path())
            .allocate("#!/bin/sh\necho \"compiled $1\"\n", Language::C)
            .await
            .unwrap();

        let mut child = launcher.launch(Language::C, &mut workspace).await.unwrap();
        assert_eq!(read_all(&mut child).await, "compiled arg\n");
        assert!(child.finish().await.is_success());
        assert!(workspace.files().iter().any(|f| f.ends_with("program")));

        workspace.release().await.unwrap();
    }

    #[tokio::test]
    async fn compiler_receives_stdio_unit() {
        let root = tempfile::tempdir().unwrap();
        let launcher = launcher(vec![(
            Language::Cpp,
            toolchain(
                Some(vec![
                    "/bin/sh",
                    "-c",
                    "grep -q _IONBF \"$2\" && cp \"$0\" \"$1\" && chmod +x \"$1\"",
                    "{source}",
                    "{output}",
                ]),
                vec!["{binary}"],
            ),
        )]);
        let mut workspace = WorkspaceStore::new(root.path())
            .allocate("#!/bin/sh\necho ready\n", Language::Cpp)
            .await
            .unwrap();

        let mut child = launcher.launch(Language::Cpp, &mut workspace).await.unwrap();
        assert_eq!(read_all(&mut child).await, "ready\n");
        assert!(child.finish().await.is_success());

        let unit = harness::stdio_file_name(workspace.token());
        assert!(workspace.dir().join(&unit).exists());
        assert!(workspace.files().iter().any(|f| f.ends_with(&unit)));

        workspace.release().await.unwrap();
    }

    #[tokio::test]
    async fn compile_failure_returns_diagnostic() {
        let root = tempfile::tempdir().unwrap();
        let launcher = launcher(vec![(
            Language::C,
            toolchain(
                Some(vec!["/bin/sh", "-c", "echo \"$0:1: error: expected expression\" >&2; exit 1", "{source}"]),
                vec!["{binary}"],
            ),
        )]);
        let mut workspace = WorkspaceStore::new(root.path())
            .allocate("int main(){return", Language::C)
            .await
            .unwrap();

        let err = launcher
            .launch(Language::C, &mut workspace)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CompileError);
        assert!(err.detail().contains("error: expected expression"));

        workspace.release().await.unwrap();
    }

    #[tokio::test]
    async fn missing_toolchain_is_unsupported() {
        let root = tempfile::tempdir().unwrap();
        let launcher = launcher(Vec::new());
        let mut workspace = WorkspaceStore::new(root.path())
            .allocate("", Language::JavaScript)
            .await
            .unwrap();

        let err = launcher
            .launch(Language::JavaScript, &mut workspace)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedLanguage);

        workspace.release().await.unwrap();
    }

    #[tokio::test]
    async fn missing_program_is_launch_failure() {
        let root = tempfile::tempdir().unwrap();
        let launcher = launcher(vec![(
            Language::Python,
            toolchain(None, vec!["/definitely/not/python3", "{source}"]),
        )]);
        let mut workspace = WorkspaceStore::new(root.path())
            .allocate("", Language::Python)
            .await
            .unwrap();

        let err = launcher
            .launch(Language::Python, &mut workspace)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LaunchFailure);

        workspace.release().await.unwrap();
    }
}
