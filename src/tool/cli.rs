//! steamcmd-backed instance runner

use super::traits::{InstanceRun, InstanceRunner, Invocation, ProcessExit};
use crate::config::ToolConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Binary names tried when searching PATH or the working directory
const BINARY_NAMES: [&str; 3] = ["steamcmd", "steamcmd.sh", "steamcmd.exe"];

/// Runs `steamcmd +runscript <script>` with output captured to the instance log
///
/// On unix every instance is started as the leader of its own process group,
/// so a timeout kill takes down steamcmd's helper processes too without
/// touching instances running in other slots.
///
/// # Examples
///
/// ```no_run
/// use workshop_dl::tool::CliInstanceRunner;
///
/// let runner = CliInstanceRunner::from_path().expect("steamcmd not found in PATH");
/// ```
#[derive(Debug, Clone)]
pub struct CliInstanceRunner {
    binary_path: PathBuf,
}

impl CliInstanceRunner {
    /// Create a runner with an explicit binary path
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Path of the binary this runner launches
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    /// Attempt to find steamcmd in PATH
    pub fn from_path() -> Option<Self> {
        BINARY_NAMES
            .iter()
            .find_map(|name| which::which(name).ok())
            .map(Self::new)
    }

    /// Resolve the binary from configuration
    ///
    /// An explicit `steamcmd_path` must exist. Otherwise the working directory
    /// is checked (steamcmd is commonly unpacked next to its scripts), then
    /// PATH if `search_path` is enabled.
    pub fn from_config(config: &ToolConfig) -> Result<Self> {
        if let Some(path) = &config.steamcmd_path {
            if path.is_file() {
                return Ok(Self::new(path.clone()));
            }
            return Err(Error::NotFound(format!(
                "configured steamcmd binary {} does not exist",
                path.display()
            )));
        }

        if let Some(local) = BINARY_NAMES
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.is_file())
        {
            return Ok(Self::new(local));
        }

        if config.search_path
            && let Some(runner) = Self::from_path()
        {
            return Ok(runner);
        }

        Err(Error::NotFound(
            "steamcmd not found; set steamcmd_path or put it in PATH".into(),
        ))
    }

    fn command(&self, invocation: &Invocation) -> Result<Command> {
        let log = std::fs::File::create(&invocation.log_path).map_err(|e| {
            Error::ExternalTool(format!(
                "Failed to create log {}: {}",
                invocation.log_path.display(),
                e
            ))
        })?;
        let log_err = log
            .try_clone()
            .map_err(|e| Error::ExternalTool(format!("Failed to duplicate log handle: {}", e)))?;

        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("+runscript")
            .arg(&invocation.script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);

        if let Some(parent) = invocation.install_root.parent()
            && parent.is_dir()
        {
            cmd.current_dir(parent);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        Ok(cmd)
    }
}

/// Send SIGKILL to the process group led by `pid`
///
/// Returns `false` if the signal could not be sent.
#[cfg(unix)]
fn kill_process_group(pid: u32, slot: usize) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        warn!(slot, pid, "pid does not fit pid_t, not signalling its process group");
        return false;
    };
    // SAFETY: killpg only sends a signal; pgid is the leader of the group
    // created for this child by process_group(0)
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let e = std::io::Error::last_os_error();
        debug!(slot, pid, error = %e, "killpg failed, falling back to killing the child");
        return false;
    }
    true
}

/// Kill the child and everything in its process group, then reap it
async fn terminate(child: &mut Child, slot: usize) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        kill_process_group(pid, slot);
    }

    if let Err(e) = child.kill().await {
        warn!(slot, error = %e, "failed to kill steamcmd instance");
    }
}

#[async_trait]
impl InstanceRunner for CliInstanceRunner {
    async fn run(&self, invocation: &Invocation) -> Result<InstanceRun> {
        let mut cmd = self.command(invocation)?;
        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ExternalTool(format!("Failed to execute steamcmd: {}", e)))?;

        debug!(
            slot = invocation.slot,
            pass = invocation.pass,
            pid = child.id(),
            timeout_secs = invocation.timeout.as_secs(),
            "steamcmd spawned"
        );

        let exit = tokio::select! {
            status = child.wait() => {
                let status = status?;
                ProcessExit::Completed { code: status.code() }
            }
            _ = tokio::time::sleep(invocation.timeout) => {
                info!(
                    slot = invocation.slot,
                    pass = invocation.pass,
                    elapsed_secs = started.elapsed().as_secs(),
                    "hard timeout, killing steamcmd instance"
                );
                terminate(&mut child, invocation.slot).await;
                ProcessExit::HardTimeout
            }
            _ = invocation.cancel.cancelled() => {
                terminate(&mut child, invocation.slot).await;
                ProcessExit::Cancelled
            }
        };

        Ok(InstanceRun {
            exit,
            elapsed: started.elapsed(),
        })
    }

    fn name(&self) -> &'static str {
        "steamcmd"
    }
}
