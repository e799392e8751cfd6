//! External process supervision
//!
//! Commands run through `sh -c` in their own process group so that signals
//! reach the whole pipeline a shell command may start, not only the shell.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Signals used to stop supervised processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Lets encoders finalize the file they are writing
    Interrupt,
    Terminate,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// A shell command running as the leader of its own process group
pub struct ProcessGroup {
    label: String,
    child: Child,
    pgid: Option<i32>,
}

impl ProcessGroup {
    /// Start `command` via `sh -c`. Stdout is discarded, stderr goes to ours.
    pub fn spawn_shell(label: &str, command: &str) -> io::Result<Self> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        let pgid = child.id().map(|id| id as i32);
        debug!("Started {} (pgid {:?}): {}", label, pgid, command);

        Ok(Self {
            label: label.to_string(),
            child,
            pgid,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Exit status if the process has already exited
    pub fn try_exited(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Send `signal` to every process in the group
    pub fn signal(&mut self, signal: Signal) -> io::Result<()> {
        #[cfg(unix)]
        {
            let Some(pgid) = self.pgid else {
                return Ok(());
            };
            let rc = unsafe { libc::killpg(pgid, signal.as_raw()) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                // Whole group already gone
                if err.raw_os_error() == Some(libc::ESRCH) {
                    return Ok(());
                }
                return Err(err);
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            let _ = signal;
            self.child.start_kill()
        }
    }

    /// Wait for the group leader to exit
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Send `first`, give the group `grace` to exit, then kill it
    pub async fn shutdown(&mut self, first: Signal, grace: Duration) -> io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            // Leader is gone but stragglers may still hold the device
            let _ = self.signal(Signal::Kill);
            return Ok(status);
        }

        self.signal(first)?;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!("{} did not stop gracefully, killing...", self.label);
                self.signal(Signal::Kill)?;
                self.child.wait().await
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            debug!("Killing {} on drop", self.label);
            let _ = self.signal(Signal::Kill);
        }
    }
}
