//! Process runner
//!
//! Every child runs in its own process group. The group is killed when the
//! command times out and again when the runner is done with it, so background
//! children never outlive the call or keep the output pipes open.

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::output::{capture, CapturedOutput};
use super::{CommandSpec, ResourceLimits};
use crate::core::constants::MAX_OUTPUT_LENGTH;

/// How long to wait for output pipes to close once the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Raw result of one process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Exit code; `-signal` if killed by a signal; `None` on timeout
    pub return_code: Option<i32>,
    /// Signal that terminated the process, if any
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
}

/// Runs commands as direct children of the worker.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    max_output_len: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(MAX_OUTPUT_LENGTH)
    }
}

/// Kills the whole process group on drop.
struct ProcessGroup(Option<Pid>);

impl ProcessGroup {
    fn kill(&self) {
        if let Some(pgid) = self.0 {
            // ESRCH just means everything already exited
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

impl ProcessRunner {
    /// Create a runner keeping at most `max_output_len` characters per stream
    pub fn new(max_output_len: usize) -> Self {
        Self { max_output_len }
    }

    /// Run `cmd` to completion or until `timeout` elapses.
    ///
    /// Errors are reserved for failures to start or supervise the process;
    /// non-zero exits and timeouts are reported in the outcome.
    pub async fn run(
        &self,
        cmd: &CommandSpec,
        stdin_content: Option<&str>,
        timeout: Duration,
        rlimits: Option<ResourceLimits>,
    ) -> Result<ProcessOutcome> {
        debug!("Running {:?} (timeout {:?})", cmd.to_vec(), timeout);

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(if stdin_content.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        for (key, value) in &cmd.env {
            command.env(key, value);
        }
        if let Some(dir) = &cmd.work_dir {
            command.current_dir(dir);
        }
        if let Some(limits) = rlimits {
            apply_rlimits(&mut command, limits);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {}", cmd.program))?;
        let group = ProcessGroup(child.id().map(|id| Pid::from_raw(id as i32)));

        let stdin_task = match (stdin_content, child.stdin.take()) {
            (Some(content), Some(mut pipe)) => {
                let content = content.to_owned();
                Some(tokio::spawn(async move {
                    // The child may exit without reading; a broken pipe is fine.
                    let _ = pipe.write_all(content.as_bytes()).await;
                }))
            }
            _ => None,
        };

        let max_len = self.max_output_len;
        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(capture(out, max_len)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(capture(err, max_len)));

        let (status, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => (status.context("Failed to wait for process")?, false),
            Err(_) => {
                debug!("{} timed out after {:?}", cmd.program, timeout);
                group.kill();
                let _ = child.start_kill();
                let status = child
                    .wait()
                    .await
                    .context("Failed to wait for killed process")?;
                (status, true)
            }
        };
        drop(group);

        if let Some(task) = stdin_task {
            task.abort();
        }
        let stdout = drain(stdout_task).await;
        let stderr = drain(stderr_task).await;

        let signal = status.signal();
        let return_code = if timed_out {
            None
        } else {
            status.code().or(signal.map(|sig| -sig))
        };

        Ok(ProcessOutcome {
            return_code,
            signal,
            timed_out,
            stdout,
            stderr,
        })
    }
}

async fn drain(task: Option<JoinHandle<std::io::Result<CapturedOutput>>>) -> CapturedOutput {
    let Some(mut task) = task else {
        return CapturedOutput::default();
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(Ok(output))) => output,
        Ok(Ok(Err(e))) => {
            warn!("Failed to read process output: {}", e);
            CapturedOutput::default()
        }
        Ok(Err(e)) => {
            warn!("Output reader task failed: {}", e);
            CapturedOutput::default()
        }
        Err(_) => {
            warn!("Output pipe still open {:?} after exit, giving up", DRAIN_TIMEOUT);
            task.abort();
            CapturedOutput::default()
        }
    }
}

fn apply_rlimits(command: &mut Command, limits: ResourceLimits) {
    use nix::sys::resource::{setrlimit, Resource};

    // SAFETY: only async-signal-safe setrlimit calls run between fork and exec.
    unsafe {
        command.pre_exec(move || {
            setrlimit(
                Resource::RLIMIT_STACK,
                limits.max_stack_size,
                limits.max_stack_size,
            )?;
            setrlimit(
                Resource::RLIMIT_AS,
                limits.max_virtual_memory,
                limits.max_virtual_memory,
            )?;
            if limits.max_num_processes > 0 {
                let nproc = u64::from(limits.max_num_processes);
                setrlimit(Resource::RLIMIT_NPROC, nproc, nproc)?;
            }
            Ok(())
        });
    }
}
