//! Container runtime used for image builds.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::GraderConfig;
use crate::core::constants::{IMAGE_BUILD_CPU_PERIOD, IMAGE_BUILD_CPU_QUOTA};
use crate::core::CommandFailed;
use crate::runner::{CommandSpec, ProcessRunner};

const INSPECT_TIMEOUT: Duration = Duration::from_secs(60);

/// The parts of `docker inspect`'s `.Config` we validate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Command that builds `context` into an image tagged `tag`
    fn build_command(&self, tag: &str, context: &Path) -> CommandSpec;

    async fn inspect_config(&self, tag: &str) -> Result<ImageConfig>;

    /// Publish `tag` to its registry
    async fn push(&self, tag: &str) -> Result<()>;
}

/// `docker` command line client
pub struct DockerCli {
    docker_bin: String,
    memory_limit: String,
    nproc_limit: u32,
    push_timeout: Duration,
    runner: ProcessRunner,
}

impl DockerCli {
    pub fn new(config: &GraderConfig) -> Self {
        Self {
            docker_bin: config.docker_bin.clone(),
            memory_limit: config.image_build_memory_limit.clone(),
            nproc_limit: config.image_build_nproc_limit,
            push_timeout: config.image_build_timeout(),
            runner: ProcessRunner::default(),
        }
    }

    /// Run a docker subcommand, failing on non-zero exit. Returns stdout.
    async fn run_and_check(&self, args: &[&str], timeout: Duration) -> Result<String> {
        let spec = CommandSpec::new(&self.docker_bin).with_args(args.iter().copied());
        debug!("Running {:?}", spec.to_vec());
        let outcome = self.runner.run(&spec, None, timeout, None).await?;
        match outcome.return_code {
            Some(0) if !outcome.timed_out => Ok(outcome.stdout.text().into_owned()),
            status => Err(CommandFailed {
                argv: spec.to_vec(),
                status: status.unwrap_or(-1),
                output: format!("{}{}", outcome.stdout.text(), outcome.stderr.text()),
            }
            .into()),
        }
    }
}

/// Arguments for `docker build` with the platform's resource caps.
pub fn build_args(memory_limit: &str, nproc_limit: u32, tag: &str, context: &Path) -> Vec<String> {
    vec![
        "build".to_string(),
        "--no-cache".to_string(),
        "--pull".to_string(),
        "--memory".to_string(),
        memory_limit.to_string(),
        "--memory-swap".to_string(),
        memory_limit.to_string(),
        "--ulimit".to_string(),
        format!("nproc={0}:{0}", nproc_limit),
        // half of one CPU
        format!("--cpu-period={}", IMAGE_BUILD_CPU_PERIOD),
        format!("--cpu-quota={}", IMAGE_BUILD_CPU_QUOTA),
        "-t".to_string(),
        tag.to_string(),
        context.display().to_string(),
    ]
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn build_command(&self, tag: &str, context: &Path) -> CommandSpec {
        CommandSpec::new(&self.docker_bin).with_args(build_args(
            &self.memory_limit,
            self.nproc_limit,
            tag,
            context,
        ))
    }

    async fn inspect_config(&self, tag: &str) -> Result<ImageConfig> {
        let output = self
            .run_and_check(&["inspect", "--format", "{{json .Config}}", tag], INSPECT_TIMEOUT)
            .await?;
        serde_json::from_str(output.trim())
            .with_context(|| format!("Unexpected image config for {}: {}", tag, output))
    }

    async fn push(&self, tag: &str) -> Result<()> {
        self.run_and_check(&["push", tag], self.push_timeout).await?;
        info!("Pushed image {}", tag);
        Ok(())
    }
}

/// Fresh registry tag for one build of `task_id`.
///
/// The registry host is resolved to its IPv4 address, and a random suffix
/// keeps rebuilds of the same task apart.
pub async fn image_tag(registry_host: &str, registry_port: u16, task_id: i64) -> Result<String> {
    let ip = tokio::net::lookup_host((registry_host, registry_port))
        .await
        .with_context(|| format!("Failed to resolve registry host {}", registry_host))?
        .map(|addr| addr.ip())
        .find(IpAddr::is_ipv4)
        .with_context(|| format!("Registry host {} has no IPv4 address", registry_host))?;

    Ok(format!(
        "{}:{}/build{}_result{}",
        ip,
        registry_port,
        task_id,
        uuid::Uuid::new_v4().simple()
    ))
}
