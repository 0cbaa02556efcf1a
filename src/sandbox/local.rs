//! Local sandbox
//!
//! A temporary working directory plus per-command rlimits. There is no
//! namespace isolation; this backend is for development and tests.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::fs;
use tracing::{debug, info};

use super::{
    CommandExecutionRequest, CommandExecutionResult, Sandbox, SandboxHandle, SandboxOptions,
    SandboxState,
};
use crate::runner::{CommandSpec, ProcessRunner};

pub struct LocalSandbox {
    handle: SandboxHandle,
    dir: Option<TempDir>,
    runner: ProcessRunner,
    /// Set for every command, on top of the worker's environment
    env: Vec<(String, String)>,
}

impl LocalSandbox {
    pub fn start(options: &SandboxOptions) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("ag-sandbox-")
            .tempdir()
            .context("Failed to create sandbox directory")?;
        let id = dir
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let env = vec![("HOME".to_string(), dir.path().display().to_string())];
        let mut handle = SandboxHandle::new(id, options.limits);
        handle.state = SandboxState::Active;
        info!("Started local sandbox at {}", dir.path().display());

        Ok(Self {
            handle,
            dir: Some(dir),
            runner: ProcessRunner::default(),
            env,
        })
    }

    #[cfg(test)]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Working directory, while the sandbox is active
    pub fn work_dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(|d| d.path())
    }

    fn active_dir(&self) -> Result<&Path> {
        self.handle.ensure_active()?;
        self.work_dir().context("Sandbox directory is gone")
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    async fn add_files(&self, files: &[PathBuf]) -> Result<()> {
        let dir = self.active_dir()?;
        for file in files {
            let name = file
                .file_name()
                .with_context(|| format!("{} has no file name", file.display()))?;
            fs::copy(file, dir.join(name))
                .await
                .with_context(|| format!("Failed to copy {} into sandbox", file.display()))?;
        }
        Ok(())
    }

    async fn run_command(
        &self,
        request: &CommandExecutionRequest,
    ) -> Result<CommandExecutionResult> {
        let dir = self.active_dir()?;
        request.validate(&self.handle.limits)?;

        let limits = self.handle.limits.with_overrides(&request.limits);
        let spec = self
            .env
            .iter()
            .fold(CommandSpec::from_vec(&request.argv()), |spec, (key, value)| {
                spec.with_env(key, value)
            })
            .with_work_dir(dir);
        debug!("Local sandbox {} running {:?}", self.handle.id, spec.to_vec());

        let outcome = self
            .runner
            .run(&spec, request.stdin.as_deref(), request.timeout, Some(limits))
            .await?;
        Ok(outcome.into())
    }

    async fn teardown(&mut self) -> Result<()> {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().display().to_string();
            dir.close()
                .with_context(|| format!("Failed to remove sandbox directory {}", path))?;
            info!("Tore down local sandbox {}", path);
        }
        self.handle.state = SandboxState::TornDown;
        Ok(())
    }
}
