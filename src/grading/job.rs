//! Grading job and result types received from / sent to the queue.

use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::core::constants::DEFAULT_SUBPROCESS_TIMEOUT;
use crate::core::ConfigError;
use crate::feedback::{CommandFeedback, CommandPoints, FeedbackCategory, FeedbackConfigs};
use crate::recorder::{CommandResultRecord, DiffResult, Expectations};
use crate::runner::LimitOverrides;
use crate::sandbox::command::validate_filename;
use crate::sandbox::{CommandExecutionRequest, CommandProgram};
use crate::storage::ProjectFileStore;

/// Job received from the Redis queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingJob {
    pub submission_id: i64,
    pub project_id: i64,
    /// Submitted files, base64 encoded
    #[serde(default)]
    pub files: Vec<SubmittedFile>,
    /// Project files copied into the sandbox before any command runs
    #[serde(default)]
    pub resource_files: Vec<String>,
    /// Defaults to the worker's configured image
    #[serde(default)]
    pub sandbox_image: Option<String>,
    #[serde(default)]
    pub allow_network_access: bool,
    /// Feedback view included with each command result
    #[serde(default = "default_feedback_category")]
    pub feedback_category: FeedbackCategory,
    pub test_cases: Vec<TestCaseSpec>,
}

fn default_feedback_category() -> FeedbackCategory {
    FeedbackCategory::Normal
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedFile {
    pub name: String,
    pub content: String,
}

impl SubmittedFile {
    pub fn decode(&self) -> Result<Vec<u8>> {
        validate_filename(&self.name)?;
        base64::engine::general_purpose::STANDARD
            .decode(&self.content)
            .with_context(|| format!("Invalid base64 content for {}", self.name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseSpec {
    pub name: String,
    pub commands: Vec<GradedCommand>,
}

/// One command of a test case, as configured by the instructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradedCommand {
    /// Identifies this command's stored result and output files
    pub result_id: i64,
    pub name: String,
    pub program: CommandProgram,
    #[serde(default)]
    pub stdin: StdinSource,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub limits: LimitOverrides,
    #[serde(default)]
    pub expected: Expectations,
    #[serde(default)]
    pub points: CommandPoints,
    #[serde(default)]
    pub feedback: FeedbackConfigs,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_SUBPROCESS_TIMEOUT
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum StdinSource {
    #[default]
    None,
    Text { text: String },
    ProjectFile { filename: String },
}

impl StdinSource {
    pub async fn resolve(
        &self,
        project_id: i64,
        files: &dyn ProjectFileStore,
    ) -> Result<Option<String>, ConfigError> {
        match self {
            StdinSource::None => Ok(None),
            StdinSource::Text { text } => Ok(Some(text.clone())),
            StdinSource::ProjectFile { filename } => files
                .read_string(project_id, filename)
                .await
                .map(Some)
                .map_err(|e| ConfigError::UnreadableProjectFile {
                    filename: filename.clone(),
                    reason: format!("{:#}", e),
                }),
        }
    }
}

impl GradedCommand {
    pub fn request(&self, stdin: Option<String>) -> CommandExecutionRequest {
        let request = CommandExecutionRequest::new(self.program.clone())
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_limits(self.limits);
        match stdin {
            Some(stdin) => request.with_stdin(stdin),
            None => request,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingStatus {
    Finished,
    /// Invalid command configuration; nothing was run
    ConfigError,
    /// Sandbox or storage failure
    Error,
}

/// Result of grading a submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingResult {
    pub submission_id: i64,
    pub status: GradingStatus,
    pub test_cases: Vec<TestCaseResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl GradingResult {
    pub fn failed(submission_id: i64, status: GradingStatus, message: String) -> Self {
        Self {
            submission_id,
            status,
            test_cases: Vec::new(),
            error_message: Some(message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub name: String,
    pub commands: Vec<CommandReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReport {
    pub result_id: i64,
    pub name: String,
    /// `None` if the command was skipped or could not be run
    pub record: Option<CommandResultRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<CommandFeedback>,
    /// Actual output, present only where the feedback view shows it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_diff: Option<DiffResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_diff: Option<DiffResult>,
    /// An earlier compile step of the test case failed
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}
