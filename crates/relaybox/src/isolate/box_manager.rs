//! Box lifecycle management for isolate
//!
//! Manages the initialization, use, and cleanup of Isolate sandbox boxes.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument, warn};

use crate::isolate::IsolateError;
use crate::isolate::command::{IsolateAction, IsolateCommand};

/// An initialized Isolate sandbox.
///
/// Call [`cleanup()`](Self::cleanup) before dropping. `Drop` falls back to a
/// best-effort cleanup on a spawned thread and logs a warning.
#[derive(Debug)]
pub struct IsolateBox {
    id: u32,
    box_path: PathBuf,
    isolate_path: PathBuf,
    initialized: bool,
    cgroup: bool,
    lease: Option<BoxLease>,
}

impl IsolateBox {
    /// Run `isolate --init` for the given box id
    #[instrument(skip(isolate_path))]
    pub async fn init(
        id: u32,
        isolate_path: impl Into<PathBuf>,
        cgroup: bool,
    ) -> Result<Self, IsolateError> {
        let isolate_path = isolate_path.into();
        let args = IsolateCommand::new(&isolate_path, id)
            .action(IsolateAction::Init)
            .cgroup(cgroup)
            .build();

        debug!(?args, "initializing isolate box");

        let output = Command::new(&args[0])
            .args(&args[1..])
            .output()
            .await
            .map_err(|source| IsolateError::SpawnFailed {
                program: args[0].clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(IsolateError::InitFailed {
                id,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // isolate prints the box directory on stdout
        let box_path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        if !box_path.exists() {
            return Err(IsolateError::InitFailed {
                id,
                message: format!("box path does not exist: {}", box_path.display()),
            });
        }

        debug!(?box_path, "box initialized");

        Ok(Self {
            id,
            box_path,
            isolate_path,
            initialized: true,
            cgroup,
            lease: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Host path of the box directory
    pub fn path(&self) -> &Path {
        &self.box_path
    }

    pub fn isolate_path(&self) -> &Path {
        &self.isolate_path
    }

    pub fn cgroup(&self) -> bool {
        self.cgroup
    }

    /// Host path for a bookkeeping file (e.g. a meta file) inside the box
    pub fn file_path(&self, name: &str) -> Result<PathBuf, IsolateError> {
        if name.contains("..") || name.starts_with('/') {
            return Err(IsolateError::InvalidPath(format!(
                "path traversal not allowed: {name}"
            )));
        }
        Ok(self.box_path.join(name))
    }

    /// A run command for this box with the box's cgroup setting applied
    pub fn command(&self) -> IsolateCommand {
        IsolateCommand::new(&self.isolate_path, self.id)
            .action(IsolateAction::Run)
            .cgroup(self.cgroup)
    }

    /// Run `isolate --cleanup`. Calling it twice is a no-op.
    #[must_use = "cleanup errors should be handled"]
    #[instrument(skip(self), fields(box_id = self.id))]
    pub async fn cleanup(&mut self) -> Result<(), IsolateError> {
        if !self.initialized {
            return Ok(());
        }

        let args = IsolateCommand::new(&self.isolate_path, self.id)
            .action(IsolateAction::Cleanup)
            .cgroup(self.cgroup)
            .build();

        debug!(?args, "cleaning up isolate box");

        let output = Command::new(&args[0])
            .args(&args[1..])
            .output()
            .await
            .map_err(|source| IsolateError::SpawnFailed {
                program: args[0].clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(stderr = %stderr, "cleanup failed");
            return Err(IsolateError::CleanupFailed {
                id: self.id,
                message: stderr.trim().to_string(),
            });
        }

        self.initialized = false;
        debug!("box cleaned up");
        Ok(())
    }

    fn with_lease(mut self, lease: BoxLease) -> Self {
        self.lease = Some(lease);
        self
    }
}

impl Drop for IsolateBox {
    fn drop(&mut self) {
        if !self.initialized {
            return;
        }

        warn!(
            box_id = self.id,
            box_path = %self.box_path.display(),
            "IsolateBox dropped without cleanup, cleaning up on a background thread"
        );

        let args = IsolateCommand::new(&self.isolate_path, self.id)
            .action(IsolateAction::Cleanup)
            .cgroup(self.cgroup)
            .build();
        let id = self.id;
        // The lease moves to the thread so the id is not reused before cleanup ran
        let lease = self.lease.take();

        std::thread::spawn(move || {
            match std::process::Command::new(&args[0]).args(&args[1..]).output() {
                Ok(output) if output.status.success() => {
                    debug!(box_id = id, "best-effort cleanup succeeded");
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    warn!(box_id = id, stderr = %stderr, "best-effort cleanup failed");
                }
                Err(e) => {
                    warn!(box_id = id, error = %e, "best-effort cleanup spawn failed");
                }
            }
            drop(lease);
        });
    }
}

/// Reservation of one box id, returned to the pool on drop
#[derive(Debug)]
struct BoxLease {
    id: u32,
    free: Arc<Mutex<VecDeque<u32>>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for BoxLease {
    fn drop(&mut self) {
        // The id goes back before the permit field is dropped
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.push_back(self.id);
    }
}

/// Pool of isolate box ids.
///
/// At most `count` boxes are live at once; `acquire` waits for a free one.
#[derive(Debug)]
pub struct BoxPool {
    isolate_path: PathBuf,
    cgroup: bool,
    semaphore: Arc<Semaphore>,
    free: Arc<Mutex<VecDeque<u32>>>,
}

impl BoxPool {
    pub fn new(first_id: u32, count: u32, isolate_path: impl Into<PathBuf>, cgroup: bool) -> Self {
        Self {
            isolate_path: isolate_path.into(),
            cgroup,
            semaphore: Arc::new(Semaphore::new(count as usize)),
            free: Arc::new(Mutex::new((first_id..first_id.saturating_add(count)).collect())),
        }
    }

    /// Wait for a free id and initialize its box
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<IsolateBox, IsolateError> {
        let lease = self.lease().await?;
        debug!(id = lease.id, "acquired box from pool");

        let sandbox = IsolateBox::init(lease.id, &self.isolate_path, self.cgroup).await?;
        Ok(sandbox.with_lease(lease))
    }

    async fn lease(&self) -> Result<BoxLease, IsolateError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| IsolateError::PoolExhausted)?;

        let id = self
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or(IsolateError::PoolExhausted)?;

        Ok(BoxLease {
            id,
            free: Arc::clone(&self.free),
            _permit: permit,
        })
    }

    /// Number of boxes that can be acquired without waiting
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
