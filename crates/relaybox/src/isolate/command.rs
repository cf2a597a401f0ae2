//! Command builder for the Isolate CLI
//!
//! Session processes talk over pipes, so the builder never redirects stdio to
//! files. `--silent` keeps isolate's own status line out of the program's
//! stderr.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::types::{MountConfig, ResourceLimits};

/// Mount point of the session workspace inside a box
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Builder for Isolate command-line arguments
#[derive(Debug)]
pub struct IsolateCommand {
    isolate_path: PathBuf,
    action: IsolateAction,
    box_id: u32,
    cgroup: bool,
    limits: ResourceLimits,
    mounts: Vec<MountConfig>,
    /// -E, --env (sorted so argument order is stable)
    env: BTreeMap<String, String>,
    /// -M, --meta
    meta_file: Option<PathBuf>,
    /// -c, --chdir
    working_dir: Option<String>,
    /// -s, --silent
    silent: bool,
    command: Vec<String>,
}

impl IsolateCommand {
    pub fn new(isolate_path: impl Into<PathBuf>, box_id: u32) -> Self {
        Self {
            isolate_path: isolate_path.into(),
            action: IsolateAction::Run,
            box_id,
            cgroup: false,
            limits: ResourceLimits::unset(),
            mounts: Vec::new(),
            env: BTreeMap::new(),
            meta_file: None,
            working_dir: None,
            silent: true,
            command: Vec::new(),
        }
    }

    pub fn action(mut self, action: IsolateAction) -> Self {
        self.action = action;
        self
    }

    /// Enable cgroup support for memory limiting
    pub fn cgroup(mut self, enable: bool) -> Self {
        self.cgroup = enable;
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn mount(mut self, mount: MountConfig) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn mounts(mut self, mounts: impl IntoIterator<Item = MountConfig>) -> Self {
        self.mounts.extend(mounts);
        self
    }

    /// Bind the host workspace read-write at [`WORKSPACE_MOUNT`] and run there
    pub fn workspace(self, host_dir: impl Into<String>) -> Self {
        self.mount(MountConfig {
            source: host_dir.into(),
            target: WORKSPACE_MOUNT.to_string(),
            writable: true,
            optional: false,
        })
        .working_dir(WORKSPACE_MOUNT)
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn meta_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.meta_file = Some(path.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn silent(mut self, enable: bool) -> Self {
        self.silent = enable;
        self
    }

    pub fn command(mut self, cmd: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.command = cmd.into_iter().map(Into::into).collect();
        self
    }

    pub fn box_id(&self) -> u32 {
        self.box_id
    }

    /// Build the command-line arguments, program first
    pub fn build(self) -> Vec<String> {
        let mut args = vec![
            self.isolate_path.to_string_lossy().into_owned(),
            format!("--box-id={}", self.box_id),
        ];

        if self.cgroup {
            args.push("--cg".to_string());
        }

        match self.action {
            IsolateAction::Init => args.push("--init".to_string()),
            IsolateAction::Cleanup => args.push("--cleanup".to_string()),
            IsolateAction::Run => {
                if self.silent {
                    args.push("--silent".to_string());
                }
                args.push("--run".to_string());
                push_limits(&mut args, &self.limits, self.cgroup);

                for mount in &self.mounts {
                    // Skip optional mounts whose source doesn't exist
                    if mount.optional && !std::path::Path::new(&mount.source).exists() {
                        continue;
                    }
                    let mut opts = String::new();
                    if mount.writable {
                        opts.push_str(":rw");
                    }
                    if mount.optional {
                        opts.push_str(":maybe");
                    }
                    args.push(format!("--dir={}={}{}", mount.target, mount.source, opts));
                }

                for (key, value) in &self.env {
                    args.push(format!("--env={key}={value}"));
                }
                if let Some(ref meta) = self.meta_file {
                    args.push(format!("--meta={}", meta.display()));
                }
                if let Some(ref dir) = self.working_dir {
                    args.push(format!("--chdir={dir}"));
                }

                args.push("--".to_string());
                args.extend(self.command);
            }
        }

        args
    }
}

fn push_limits(args: &mut Vec<String>, limits: &ResourceLimits, cgroup: bool) {
    if let Some(time) = limits.time_limit {
        args.push(format!("--time={time}"));
    }
    if let Some(wall_time) = limits.wall_time_limit {
        args.push(format!("--wall-time={wall_time}"));
    }
    if let Some(extra_time) = limits.extra_time {
        args.push(format!("--extra-time={extra_time}"));
    }
    if let Some(memory) = limits.memory_limit {
        if cgroup {
            args.push(format!("--cg-mem={memory}"));
        } else {
            args.push(format!("--mem={memory}"));
        }
    }
    if let Some(stack) = limits.stack_limit {
        args.push(format!("--stack={stack}"));
    }
    if let Some(procs) = limits.max_processes {
        args.push(format!("--processes={procs}"));
    }
    if let Some(fsize) = limits.max_output {
        args.push(format!("--fsize={fsize}"));
    }
    if let Some(open_files) = limits.max_open_files {
        args.push(format!("--open-files={open_files}"));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateAction {
    Init,
    Run,
    Cleanup,
}
