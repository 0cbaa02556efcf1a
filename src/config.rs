//! Worker configuration
//!
//! Defaults, then an optional TOML file named by `GRADER_CONFIG`, then
//! environment variables. Loaded once at startup and read through
//! [`get_config`].

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::core::constants::DEFAULT_SANDBOX_IMAGE;

/// Where grading commands run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackend {
    /// One docker container per grading run
    #[default]
    Container,
    /// Temporary directory plus setrlimit, no namespace isolation
    Local,
}

/// Where project files (expected outputs, resource files) are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStorage {
    #[default]
    Local,
    S3,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    /// Memory cap for `docker build` (docker memory syntax, e.g. "4g")
    pub image_build_memory_limit: String,
    /// nproc ulimit for `docker build`
    pub image_build_nproc_limit: u32,
    /// Wall-clock limit for one image build, in seconds
    pub image_build_timeout_secs: u64,
    pub registry_host: String,
    pub registry_port: u16,
    /// Container runtime CLI
    pub docker_bin: String,
    /// Per-submission output directories are created under this root
    pub results_root: PathBuf,
    pub project_files_root: PathBuf,
    pub project_storage: ProjectStorage,
    pub sandbox_backend: SandboxBackend,
    pub default_sandbox_image: String,
    /// Unprivileged user commands run as inside sandbox containers
    pub sandbox_user: String,
    pub build_poll_interval_ms: u64,
    pub build_cancel_grace_secs: u64,
    /// Image builds allowed to run at once on this worker
    pub max_concurrent_builds: usize,
    pub redis_url: String,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            image_build_memory_limit: "4g".to_string(),
            image_build_nproc_limit: 1000,
            image_build_timeout_secs: 600,
            registry_host: "localhost".to_string(),
            registry_port: 5001,
            docker_bin: "docker".to_string(),
            results_root: PathBuf::from("/var/lib/ag-grader/results"),
            project_files_root: PathBuf::from("/var/lib/ag-grader/projects"),
            project_storage: ProjectStorage::Local,
            sandbox_backend: SandboxBackend::Container,
            default_sandbox_image: DEFAULT_SANDBOX_IMAGE.to_string(),
            sandbox_user: "autograder".to_string(),
            build_poll_interval_ms: 1000,
            build_cancel_grace_secs: 3,
            max_concurrent_builds: 2,
            redis_url: "redis://localhost:6379".to_string(),
        }
    }
}

impl GraderConfig {
    /// Load from `GRADER_CONFIG` (if set) and the environment.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("GRADER_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Override fields from environment variables. `lookup` is injectable for tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid value for {}: {} ({})", key, value, e))
        }

        if let Some(v) = lookup("IMAGE_BUILD_MEMORY_LIMIT") {
            self.image_build_memory_limit = v;
        }
        if let Some(v) = lookup("IMAGE_BUILD_NPROC_LIMIT") {
            self.image_build_nproc_limit = parse("IMAGE_BUILD_NPROC_LIMIT", v)?;
        }
        if let Some(v) = lookup("IMAGE_BUILD_TIMEOUT") {
            self.image_build_timeout_secs = parse("IMAGE_BUILD_TIMEOUT", v)?;
        }
        if let Some(v) = lookup("SANDBOX_IMAGE_REGISTRY_HOST") {
            self.registry_host = v;
        }
        if let Some(v) = lookup("SANDBOX_IMAGE_REGISTRY_PORT") {
            self.registry_port = parse("SANDBOX_IMAGE_REGISTRY_PORT", v)?;
        }
        if let Some(v) = lookup("DOCKER_BIN") {
            self.docker_bin = v;
        }
        if let Some(v) = lookup("RESULTS_ROOT") {
            self.results_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("PROJECT_FILES_ROOT") {
            self.project_files_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("PROJECT_STORAGE") {
            self.project_storage = match v.to_lowercase().as_str() {
                "local" => ProjectStorage::Local,
                "s3" => ProjectStorage::S3,
                other => anyhow::bail!("Invalid value for PROJECT_STORAGE: {}", other),
            };
        }
        if let Some(v) = lookup("SANDBOX_BACKEND") {
            self.sandbox_backend = match v.to_lowercase().as_str() {
                "container" => SandboxBackend::Container,
                "local" => SandboxBackend::Local,
                other => anyhow::bail!("Invalid value for SANDBOX_BACKEND: {}", other),
            };
        }
        if let Some(v) = lookup("DEFAULT_SANDBOX_IMAGE") {
            self.default_sandbox_image = v;
        }
        if let Some(v) = lookup("SANDBOX_USER") {
            self.sandbox_user = v;
        }
        if let Some(v) = lookup("BUILD_POLL_INTERVAL_MS") {
            self.build_poll_interval_ms = parse("BUILD_POLL_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("BUILD_CANCEL_GRACE_SECS") {
            self.build_cancel_grace_secs = parse("BUILD_CANCEL_GRACE_SECS", v)?;
        }
        if let Some(v) = lookup("MAX_CONCURRENT_BUILDS") {
            self.max_concurrent_builds = parse("MAX_CONCURRENT_BUILDS", v)?;
        }
        if let Some(v) = lookup("REDIS_URL") {
            self.redis_url = v;
        }
        Ok(())
    }

    pub fn image_build_timeout(&self) -> Duration {
        Duration::from_secs(self.image_build_timeout_secs)
    }

    pub fn build_poll_interval(&self) -> Duration {
        Duration::from_millis(self.build_poll_interval_ms)
    }

    pub fn build_cancel_grace(&self) -> Duration {
        Duration::from_secs(self.build_cancel_grace_secs)
    }

    /// Output directory for one submission's command results.
    pub fn result_output_dir(&self, submission_id: i64) -> PathBuf {
        self.results_root
            .join(format!("submission_{}", submission_id))
            .join(crate::core::constants::RESULT_OUTPUT_DIRNAME)
    }
}

/// Global worker configuration
static GRADER_CONFIG: OnceLock<GraderConfig> = OnceLock::new();

/// Install the configuration loaded at startup.
pub fn init_config(config: GraderConfig) -> Result<&'static GraderConfig> {
    GRADER_CONFIG
        .set(config)
        .map_err(|_| anyhow::anyhow!("Grader configuration already initialized"))?;
    Ok(get_config())
}

/// Get worker configuration
pub fn get_config() -> &'static GraderConfig {
    GRADER_CONFIG.get().unwrap_or_else(|| {
        static DEFAULT: OnceLock<GraderConfig> = OnceLock::new();

        warn!("Grader configuration not initialized, using default");
        DEFAULT.get_or_init(GraderConfig::default)
    })
}
