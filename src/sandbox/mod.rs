//! Sandbox module - isolated, resource-limited execution environments
//!
//! A sandbox lives for one grading run. Commands run in it sequentially and
//! share its filesystem. Teardown happens through [`Sandbox::teardown`] or,
//! if that never ran (early return, panic), when the sandbox is dropped.
//!
//! The sandbox module does NOT:
//! - Compare outputs or decide correctness
//! - Tell resource-limit kills apart from other signals

pub mod command;
pub mod container;
pub mod local;

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{GraderConfig, SandboxBackend};
use crate::runner::ResourceLimits;

pub use command::{CommandExecutionRequest, CommandExecutionResult, CommandProgram};
pub use container::ContainerSandbox;
pub use local::LocalSandbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    NotStarted,
    Active,
    TornDown,
}

/// Identity and limits of one live sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub id: String,
    /// Defaults for every command unless overridden per request
    pub limits: ResourceLimits,
    pub state: SandboxState,
}

impl SandboxHandle {
    pub fn new(id: impl Into<String>, limits: ResourceLimits) -> Self {
        Self {
            id: id.into(),
            limits,
            state: SandboxState::NotStarted,
        }
    }

    pub fn ensure_active(&self) -> Result<()> {
        if self.state != SandboxState::Active {
            anyhow::bail!("Sandbox {} is {:?}, not active", self.id, self.state);
        }
        Ok(())
    }
}

/// Settings for acquiring a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub image: String,
    pub allow_network_access: bool,
    pub limits: ResourceLimits,
}

impl SandboxOptions {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            allow_network_access: false,
            limits: ResourceLimits::default(),
        }
    }
}

/// An isolated execution environment
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn handle(&self) -> &SandboxHandle;

    /// Copy host files into the sandbox working directory
    async fn add_files(&self, files: &[PathBuf]) -> Result<()>;

    /// Run one command with the request's overrides applied to this call only
    async fn run_command(&self, request: &CommandExecutionRequest)
        -> Result<CommandExecutionResult>;

    /// Destroy the environment and release its resources
    async fn teardown(&mut self) -> Result<()>;
}

/// Start a sandbox on the configured backend.
pub async fn acquire(options: &SandboxOptions, config: &GraderConfig) -> Result<Box<dyn Sandbox>> {
    options.limits.validate()?;
    match config.sandbox_backend {
        SandboxBackend::Container => Ok(Box::new(ContainerSandbox::start(options, config).await?)),
        SandboxBackend::Local => Ok(Box::new(LocalSandbox::start(options)?)),
    }
}
