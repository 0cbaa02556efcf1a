//! Runs one image build process.
//!
//! Output goes to the task's log file. The build is killed when it exceeds
//! its timeout. On cancellation it gets SIGTERM, then SIGKILL if it is still
//! alive after the grace period.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::runner::CommandSpec;

/// How a build process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOutcome {
    /// What the OS reported; `-signal` if killed
    pub return_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
}

pub struct ImageBuilder {
    command: CommandSpec,
    output_filename: PathBuf,
    timeout: Duration,
    cancel_grace: Duration,
}

impl ImageBuilder {
    pub fn new(
        command: CommandSpec,
        output_filename: PathBuf,
        timeout: Duration,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            command,
            output_filename,
            timeout,
            cancel_grace,
        }
    }

    /// Run the build to completion, timeout, or cancellation.
    ///
    /// Dropping `cancel`'s sender without sending does not cancel.
    pub async fn run(self, mut cancel: oneshot::Receiver<()>) -> Result<BuildOutcome> {
        let output = std::fs::File::create(&self.output_filename).with_context(|| {
            format!(
                "Failed to create build output file {}",
                self.output_filename.display()
            )
        })?;
        let stderr = output
            .try_clone()
            .context("Failed to duplicate build output handle")?;

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(output))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start build {:?}", self.command.to_vec()))?;
        let pgid = child.id().map(|id| Pid::from_raw(id as i32));
        debug!("Build process {:?} started: {:?}", pgid, self.command.to_vec());

        let mut timed_out = false;
        let mut cancelled = false;
        let status = tokio::select! {
            status = child.wait() => status.context("Failed to wait for build")?,
            _ = tokio::time::sleep(self.timeout) => {
                warn!("Build exceeded {:?}, killing", self.timeout);
                timed_out = true;
                kill(&mut child, pgid).await?
            }
            Ok(()) = &mut cancel => {
                info!("Cancelling build");
                cancelled = true;
                self.terminate(&mut child, pgid).await?
            }
        };

        Ok(BuildOutcome {
            return_code: status.code().or(status.signal().map(|sig| -sig)),
            timed_out,
            cancelled,
        })
    }

    async fn terminate(&self, child: &mut Child, pgid: Option<Pid>) -> Result<ExitStatus> {
        if let Some(pgid) = pgid {
            let _ = killpg(pgid, Signal::SIGTERM);
        }
        match tokio::time::timeout(self.cancel_grace, child.wait()).await {
            Ok(status) => status.context("Failed to wait for cancelled build"),
            Err(_) => {
                warn!(
                    "Build ignored SIGTERM for {:?}, killing",
                    self.cancel_grace
                );
                kill(child, pgid).await
            }
        }
    }
}

async fn kill(child: &mut Child, pgid: Option<Pid>) -> Result<ExitStatus> {
    if let Some(pgid) = pgid {
        let _ = killpg(pgid, Signal::SIGKILL);
    }
    let _ = child.start_kill();
    child.wait().await.context("Failed to wait for killed build")
}
