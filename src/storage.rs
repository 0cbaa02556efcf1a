//! Project file storage
//!
//! Resolves a project-relative filename (expected outputs, resource files,
//! build contexts) to its content, from local disk or MinIO/S3.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::Client;
use tracing::info;

use crate::config::{GraderConfig, ProjectStorage};
use crate::core::constants::PROJECT_FILES_DIRNAME;
use crate::sandbox::command::validate_filename;

#[async_trait]
pub trait ProjectFileStore: Send + Sync {
    /// Read one uploaded project file
    async fn read(&self, project_id: i64, filename: &str) -> Result<Vec<u8>>;

    async fn read_string(&self, project_id: i64, filename: &str) -> Result<String> {
        let bytes = self.read(project_id, filename).await?;
        String::from_utf8(bytes).with_context(|| format!("{} is not valid UTF-8", filename))
    }

    /// Copy a project file into `dest_dir`, returning the new path
    async fn fetch_to(&self, project_id: i64, filename: &str, dest_dir: &Path) -> Result<PathBuf> {
        let bytes = self.read(project_id, filename).await?;
        let dest = dest_dir.join(filename);
        tokio::fs::write(&dest, bytes)
            .await
            .with_context(|| format!("Failed to write {}", dest.display()))?;
        Ok(dest)
    }
}

/// Build the configured project file store.
pub async fn from_config(config: &GraderConfig) -> Result<Box<dyn ProjectFileStore>> {
    match config.project_storage {
        ProjectStorage::Local => Ok(Box::new(LocalProjectFiles::new(
            config.project_files_root.clone(),
        ))),
        ProjectStorage::S3 => Ok(Box::new(S3ProjectFiles::from_env().await?)),
    }
}

/// Project files laid out as `<root>/project_<id>/project_files/<name>`
#[derive(Debug, Clone)]
pub struct LocalProjectFiles {
    root: PathBuf,
}

impl LocalProjectFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn project_files_dir(&self, project_id: i64) -> PathBuf {
        self.root
            .join(format!("project_{}", project_id))
            .join(PROJECT_FILES_DIRNAME)
    }

    pub fn path_of(&self, project_id: i64, filename: &str) -> Result<PathBuf> {
        validate_filename(filename)?;
        Ok(self.project_files_dir(project_id).join(filename))
    }
}

#[async_trait]
impl ProjectFileStore for LocalProjectFiles {
    async fn read(&self, project_id: i64, filename: &str) -> Result<Vec<u8>> {
        let path = self.path_of(project_id, filename)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read project file {}", path.display()))
    }
}

/// S3/MinIO storage client for project files
#[derive(Clone)]
pub struct S3ProjectFiles {
    client: Client,
    bucket: String,
}

impl S3ProjectFiles {
    /// Create a new storage client from environment variables
    pub async fn from_env() -> Result<Self> {
        let endpoint = std::env::var("MINIO_ENDPOINT").unwrap_or_else(|_| "localhost".into());
        let port = std::env::var("MINIO_PORT").unwrap_or_else(|_| "9000".into());
        let access_key = std::env::var("MINIO_ACCESS_KEY").unwrap_or_else(|_| "minioadmin".into());
        let secret_key = std::env::var("MINIO_SECRET_KEY").unwrap_or_else(|_| "minioadmin".into());
        let bucket = std::env::var("MINIO_BUCKET").unwrap_or_else(|_| "autograder".into());
        let use_ssl = std::env::var("MINIO_USE_SSL")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let protocol = if use_ssl { "https" } else { "http" };
        let endpoint_url = format!("{}://{}:{}", protocol, endpoint, port);

        info!("Connecting to MinIO at {}", endpoint_url);

        let credentials = Credentials::new(access_key, secret_key, None, None, "minio");

        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(&endpoint_url)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(config),
            bucket,
        })
    }

    pub fn object_key(project_id: i64, filename: &str) -> Result<String> {
        validate_filename(filename)?;
        Ok(format!(
            "project_{}/{}/{}",
            project_id, PROJECT_FILES_DIRNAME, filename
        ))
    }
}

#[async_trait]
impl ProjectFileStore for S3ProjectFiles {
    async fn read(&self, project_id: i64, filename: &str) -> Result<Vec<u8>> {
        let key = Self::object_key(project_id, filename)?;
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .with_context(|| format!("Failed to download {}", key))?;

        let data = response.body.collect().await?;
        Ok(data.into_bytes().to_vec())
    }
}
