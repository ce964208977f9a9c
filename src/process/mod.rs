//! Lifecycle of the deployed application.
//!
//! At most one managed process exists at a time. Starting while one is
//! tracked and stopping while none is tracked are both no-ops.
//!
//! Termination does not go through the spawned handle: the deployed
//! application may relaunch itself under a different process (the Windows
//! player does), so it is stopped with a forced kill that matches the
//! executable. [`ProcessControl`] is the seam between this bookkeeping and the
//! OS; [`platform::SystemProcessControl`] is the real implementation.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

pub mod platform;

/// Why a forced stop did not complete normally.
#[derive(Debug, thiserror::Error)]
pub enum StopError {
    /// Nothing matched the name; usually the application exited on its own.
    #[error("no running process matched {name:?} ({detail})")]
    AlreadyExited { name: String, detail: String },
    /// The terminator itself could not be run or waited on.
    #[error("failed to terminate {name:?}: {source}")]
    Failed { name: String, source: io::Error },
}

/// OS capability used by [`ProcessManager`].
#[allow(async_fn_in_trait)]
pub trait ProcessControl {
    /// Handle kept for the lifetime of the managed process.
    type Handle;

    /// Start `executable` with `working_dir` as its current directory.
    fn spawn(&mut self, executable: &Path, working_dir: &Path) -> io::Result<Self::Handle>;

    /// Force-kill the application started from `executable` (known to the OS
    /// as `name`) and wait until the kill completed.
    async fn force_stop(&mut self, name: &str, executable: &Path) -> Result<(), StopError>;
}

/// A process started by [`ProcessManager::start`].
#[derive(Debug)]
pub struct Managed<H> {
    /// Name used for forced termination.
    pub name: String,
    pub executable: PathBuf,
    pub handle: H,
}

/// Outcome of [`ProcessManager::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// Outcome of [`ProcessManager::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// The kill found nothing; the record was cleared anyway.
    AlreadyExited,
    NotRunning,
}

/// Tracks zero or one managed process.
pub struct ProcessManager<C: ProcessControl> {
    control: C,
    current: Option<Managed<C::Handle>>,
}

impl<C: ProcessControl> ProcessManager<C> {
    pub fn new(control: C) -> Self {
        Self {
            control,
            current: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.current.is_some()
    }

    pub fn current(&self) -> Option<&Managed<C::Handle>> {
        self.current.as_ref()
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    /// Spawn `executable` unless a process is already tracked.
    pub fn start(
        &mut self,
        executable: PathBuf,
        working_dir: &Path,
        name: String,
    ) -> io::Result<StartOutcome> {
        if self.current.is_some() {
            return Ok(StartOutcome::AlreadyRunning);
        }
        let handle = self.control.spawn(&executable, working_dir)?;
        info!(executable = %executable.display(), "Started managed process");
        self.current = Some(Managed {
            name,
            executable,
            handle,
        });
        Ok(StartOutcome::Started)
    }

    /// Force-stop the tracked process by name.
    ///
    /// A kill that finds nothing is logged and reported as
    /// [`StopOutcome::AlreadyExited`]. On [`StopError::Failed`] the record is
    /// kept so a later `stop` can retry.
    pub async fn stop(&mut self) -> Result<StopOutcome, StopError> {
        let Some(managed) = self.current.as_ref() else {
            return Ok(StopOutcome::NotRunning);
        };
        let outcome = match self
            .control
            .force_stop(&managed.name, &managed.executable)
            .await
        {
            Ok(()) => StopOutcome::Stopped,
            Err(e @ StopError::AlreadyExited { .. }) => {
                warn!("Error terminating program, this is usually when the program exited on its own: {e}");
                StopOutcome::AlreadyExited
            }
            Err(e @ StopError::Failed { .. }) => return Err(e),
        };
        self.current = None;
        Ok(outcome)
    }
}
