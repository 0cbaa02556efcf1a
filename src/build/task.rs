//! BuildTask and SandboxImage records.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    InProgress,
    Done,
    Failed,
    ImageInvalid,
    InternalError,
    Cancelled,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::InProgress => "in_progress",
            BuildStatus::Done => "done",
            BuildStatus::Failed => "failed",
            BuildStatus::ImageInvalid => "image_invalid",
            BuildStatus::InternalError => "internal_error",
            BuildStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Queued | BuildStatus::InProgress)
    }

    /// `queued -> in_progress -> terminal`; `cancelled` also straight from `queued`.
    /// `in_progress -> in_progress` restarts a build whose job was redelivered.
    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        match (self, next) {
            (BuildStatus::Queued, BuildStatus::InProgress | BuildStatus::Cancelled) => true,
            (BuildStatus::InProgress, BuildStatus::InProgress) => true,
            (BuildStatus::InProgress, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => BuildStatus::Queued,
            "in_progress" => BuildStatus::InProgress,
            "done" => BuildStatus::Done,
            "failed" => BuildStatus::Failed,
            "image_invalid" => BuildStatus::ImageInvalid,
            "internal_error" => BuildStatus::InternalError,
            "cancelled" => BuildStatus::Cancelled,
            other => return Err(format!("unknown build status {:?}", other)),
        })
    }
}

/// One asynchronous image-build request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTask {
    pub id: i64,
    pub project_id: i64,
    /// Directory holding the Dockerfile and build context
    pub build_dir: PathBuf,
    /// Combined stdout/stderr of the build is written here
    pub output_filename: PathBuf,
    pub status: BuildStatus,
    pub return_code: Option<i32>,
    pub timed_out: bool,
    pub validation_error_msg: String,
    pub internal_error_msg: String,
    /// Image to update on success; a new one is created if unset
    pub image_id: Option<i64>,
}

/// Fields supplied when a build is requested. Tasks are created by the web
/// app; the worker only picks them up.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBuildTask {
    pub project_id: i64,
    pub build_dir: PathBuf,
    pub output_filename: PathBuf,
    #[serde(default)]
    pub image_id: Option<i64>,
}

#[cfg(test)]
impl NewBuildTask {
    pub fn into_task(self, id: i64) -> BuildTask {
        BuildTask {
            id,
            project_id: self.project_id,
            build_dir: self.build_dir,
            output_filename: self.output_filename,
            status: BuildStatus::Queued,
            return_code: None,
            timed_out: false,
            validation_error_msg: String::new(),
            internal_error_msg: String::new(),
            image_id: self.image_id,
        }
    }
}

/// A published sandbox image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxImage {
    pub id: i64,
    pub project_id: i64,
    pub display_name: String,
    pub tag: String,
}

pub fn new_image_display_name() -> String {
    format!("New Image {}", uuid::Uuid::new_v4().simple())
}
