//! Traits and types for running one external tool instance

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything needed to launch one instance against one chunk
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Worker slot the instance runs in
    pub slot: usize,
    /// Pass number, starting at 1
    pub pass: u32,
    /// Isolated install root handed to the tool
    pub install_root: PathBuf,
    /// Generated command script
    pub script_path: PathBuf,
    /// File receiving combined stdout and stderr
    pub log_path: PathBuf,
    /// Wall-clock budget before the instance is killed
    pub timeout: Duration,
    /// Fired when the whole run is being shut down
    pub cancel: CancellationToken,
}

/// How an instance ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// The process exited on its own; the code is informational only
    Completed {
        /// Exit code, `None` if terminated by a signal
        code: Option<i32>,
    },
    /// The budget ran out and the instance was killed
    HardTimeout,
    /// The run was cancelled and the instance was killed
    Cancelled,
}

/// Result of running one instance
#[must_use]
#[derive(Debug, Clone, Copy)]
pub struct InstanceRun {
    /// How the process ended
    pub exit: ProcessExit,
    /// Wall-clock time from spawn to exit or kill
    pub elapsed: Duration,
}

/// Runs one external tool instance to completion or timeout
///
/// Implementations own the spawned process: on timeout or cancellation they
/// must terminate exactly that process (and anything it spawned), never
/// other instances of the same tool.
#[async_trait]
pub trait InstanceRunner: Send + Sync {
    /// Launch the instance and wait for it to exit or be killed
    ///
    /// # Errors
    ///
    /// Returns an error if the log file cannot be created or the process
    /// cannot be spawned. The caller abandons the chunk for this pass.
    async fn run(&self, invocation: &Invocation) -> crate::Result<InstanceRun>;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}
