//! Container-backed sandbox
//!
//! One docker container per grading run. Commands are started with
//! `docker exec` as an unprivileged user and wrapped in `prlimit` so the
//! per-command limits apply inside the container.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{
    CommandExecutionRequest, CommandExecutionResult, Sandbox, SandboxHandle, SandboxOptions,
    SandboxState,
};
use crate::config::GraderConfig;
use crate::core::CommandFailed;
use crate::runner::{CommandSpec, ProcessRunner, ResourceLimits};

/// How long housekeeping commands (mkdir, cp, pkill) may take.
const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(60);

/// `docker run` may have to pull the image first.
const START_TIMEOUT: Duration = Duration::from_secs(600);

pub struct ContainerSandbox {
    handle: SandboxHandle,
    docker_bin: String,
    user: String,
    runner: ProcessRunner,
}

impl ContainerSandbox {
    /// Start the container and prepare the working directory.
    pub async fn start(options: &SandboxOptions, config: &GraderConfig) -> Result<Self> {
        let name = format!("ag-sandbox-{}", uuid::Uuid::new_v4().simple());
        let mut sandbox = Self {
            handle: SandboxHandle::new(name, options.limits),
            docker_bin: config.docker_bin.clone(),
            user: config.sandbox_user.clone(),
            runner: ProcessRunner::default(),
        };

        if let Err(e) = sandbox
            .docker_with_timeout(&run_args(&sandbox.handle.id, options), START_TIMEOUT)
            .await
        {
            // A failed or timed out run can still leave a container behind
            sandbox.remove_container().await;
            return Err(e)
                .with_context(|| format!("Failed to start sandbox from image {}", options.image));
        }
        // Flip to active right away so a failure below still tears the container down
        sandbox.handle.state = SandboxState::Active;

        let work_dir = sandbox.work_dir();
        let owner = sandbox.user.clone();
        sandbox
            .docker_as_root(&["mkdir", "-p", &work_dir])
            .await?;
        sandbox
            .docker_as_root(&["chown", &owner, &work_dir])
            .await?;

        info!(
            "Started sandbox {} (image: {}, network: {})",
            sandbox.handle.id, options.image, options.allow_network_access
        );
        Ok(sandbox)
    }

    /// Working directory for commands inside the container
    pub fn work_dir(&self) -> String {
        format!("/home/{}/working_dir", self.user)
    }

    async fn docker(&self, args: &[String]) -> Result<String> {
        self.docker_with_timeout(args, HOUSEKEEPING_TIMEOUT).await
    }

    async fn docker_with_timeout(&self, args: &[String], timeout: Duration) -> Result<String> {
        let spec = CommandSpec::new(&self.docker_bin).with_args(args.iter().cloned());
        let outcome = self.runner.run(&spec, None, timeout, None).await?;
        if outcome.timed_out {
            anyhow::bail!("{:?} timed out", spec.to_vec());
        }
        match outcome.return_code {
            Some(0) => Ok(outcome.stdout.text().into_owned()),
            status => Err(CommandFailed {
                argv: spec.to_vec(),
                status: status.unwrap_or(-1),
                output: format!("{}{}", outcome.stdout.text(), outcome.stderr.text()),
            }
            .into()),
        }
    }

    async fn docker_as_root(&self, argv: &[&str]) -> Result<String> {
        let mut args = vec![
            "exec".to_string(),
            "--user".to_string(),
            "root".to_string(),
            self.handle.id.clone(),
        ];
        args.extend(argv.iter().map(|a| a.to_string()));
        self.docker(&args).await
    }

    /// Best-effort `docker rm --force`; a container that never existed is fine.
    async fn remove_container(&self) {
        let args = ["rm".to_string(), "--force".to_string(), self.handle.id.clone()];
        if let Err(e) = self.docker(&args).await {
            debug!("Could not remove container {}: {:#}", self.handle.id, e);
        }
    }

    /// Kill everything the sandbox user still has running.
    async fn kill_user_processes(&self) {
        let user = self.user.clone();
        match self.docker_as_root(&["pkill", "-KILL", "-u", &user]).await {
            Ok(_) => {}
            // pkill exits 1 when nothing matched
            Err(e) if e.downcast_ref::<CommandFailed>().map(|f| f.status) == Some(1) => {}
            Err(e) => warn!("Failed to kill processes in sandbox {}: {:?}", self.handle.id, e),
        }
    }
}

/// Arguments for `docker run`.
///
/// The container keeps running on the image's interactive shell, which is
/// why images must leave CMD at bash or sh.
pub fn run_args(name: &str, options: &SandboxOptions) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--interactive".to_string(),
        "--tty".to_string(),
        "--detach".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--hostname".to_string(),
        name.to_string(),
    ];
    if !options.allow_network_access {
        args.push("--network".to_string());
        args.push("none".to_string());
    }
    args.push(options.image.clone());
    args
}

/// Arguments for `docker exec` running `argv` under `limits`.
pub fn exec_args(
    container: &str,
    user: &str,
    work_dir: &str,
    limits: &ResourceLimits,
    with_stdin: bool,
    argv: &[String],
) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if with_stdin {
        args.push("--interactive".to_string());
    }
    args.extend([
        "--user".to_string(),
        user.to_string(),
        "--workdir".to_string(),
        work_dir.to_string(),
        container.to_string(),
        "prlimit".to_string(),
        format!("--stack={0}:{0}", limits.max_stack_size),
        format!("--as={0}:{0}", limits.max_virtual_memory),
    ]);
    if limits.max_num_processes > 0 {
        args.push(format!("--nproc={0}:{0}", limits.max_num_processes));
    }
    args.push("--".to_string());
    args.extend(argv.iter().cloned());
    args
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    async fn add_files(&self, files: &[PathBuf]) -> Result<()> {
        self.handle.ensure_active()?;
        let work_dir = self.work_dir();
        for file in files {
            let name = file_name(file)?;
            self.docker(&[
                "cp".to_string(),
                file.display().to_string(),
                format!("{}:{}/{}", self.handle.id, work_dir, name),
            ])
            .await
            .with_context(|| format!("Failed to copy {} into sandbox", file.display()))?;
        }
        if !files.is_empty() {
            let owner = self.user.clone();
            self.docker_as_root(&["chown", "-R", &owner, &work_dir])
                .await?;
        }
        Ok(())
    }

    async fn run_command(
        &self,
        request: &CommandExecutionRequest,
    ) -> Result<CommandExecutionResult> {
        self.handle.ensure_active()?;
        request.validate(&self.handle.limits)?;

        let limits = self.handle.limits.with_overrides(&request.limits);
        let args = exec_args(
            &self.handle.id,
            &self.user,
            &self.work_dir(),
            &limits,
            request.stdin.is_some(),
            &request.argv(),
        );
        let spec = CommandSpec::new(&self.docker_bin).with_args(args);
        debug!("Sandbox {} running {:?}", self.handle.id, request.argv());

        let outcome = self
            .runner
            .run(&spec, request.stdin.as_deref(), request.timeout, None)
            .await?;
        if outcome.timed_out {
            // Killing the exec client leaves the command running in the container
            self.kill_user_processes().await;
        }
        Ok(outcome.into())
    }

    async fn teardown(&mut self) -> Result<()> {
        if self.handle.state != SandboxState::Active {
            return Ok(());
        }
        let id = self.handle.id.clone();
        self.docker(&["rm".to_string(), "--force".to_string(), id.clone()])
            .await
            .with_context(|| format!("Failed to remove sandbox {}", id))?;
        self.handle.state = SandboxState::TornDown;
        info!("Tore down sandbox {}", id);
        Ok(())
    }
}

impl Drop for ContainerSandbox {
    fn drop(&mut self) {
        if self.handle.state != SandboxState::Active {
            return;
        }
        warn!("Sandbox {} dropped without teardown, removing", self.handle.id);
        let status = std::process::Command::new(&self.docker_bin)
            .args(["rm", "--force", &self.handle.id])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
        if let Err(e) = status {
            warn!("Failed to remove sandbox {}: {}", self.handle.id, e);
        }
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))
}
