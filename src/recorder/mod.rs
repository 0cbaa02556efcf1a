//! Recorder module - persist command output and correctness
//!
//! Writes each command's stdout/stderr to `cmd_result_<id>_stdout` /
//! `cmd_result_<id>_stderr` in the submission's output directory and
//! compares the result against the command's expectations.
//!
//! Correctness fields are `None` when nothing was expected. Feedback
//! filtering happens later, on read.

pub mod diff;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::ConfigError;
use crate::sandbox::CommandExecutionResult;
use crate::storage::ProjectFileStore;

pub use diff::{outputs_match, DiffOptions, DiffResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedReturnCode {
    #[default]
    None,
    Zero,
    Nonzero,
}

impl ExpectedReturnCode {
    /// `None` when the return code isn't checked. A timed out command has no
    /// return code and never satisfies an expectation.
    pub fn check(&self, return_code: Option<i32>) -> Option<bool> {
        match self {
            ExpectedReturnCode::None => None,
            ExpectedReturnCode::Zero => Some(return_code == Some(0)),
            ExpectedReturnCode::Nonzero => Some(matches!(return_code, Some(rc) if rc != 0)),
        }
    }
}

/// Where an expected output comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ExpectedOutput {
    #[default]
    None,
    Text { text: String },
    ProjectFile { filename: String },
}

/// Expected values configured for one command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Expectations {
    pub return_code: ExpectedReturnCode,
    pub stdout: ExpectedOutput,
    pub stderr: ExpectedOutput,
    #[serde(flatten)]
    pub diff: DiffOptions,
}

impl Expectations {
    /// Load project-file expectations so comparison needs no further I/O.
    ///
    /// An unreadable project file is a configuration error, never "no expectation".
    pub async fn resolve(
        &self,
        project_id: i64,
        files: &dyn ProjectFileStore,
    ) -> Result<ResolvedExpectations, ConfigError> {
        Ok(ResolvedExpectations {
            return_code: self.return_code,
            stdout: resolve_output(&self.stdout, project_id, files).await?,
            stderr: resolve_output(&self.stderr, project_id, files).await?,
            diff: self.diff,
        })
    }
}

async fn resolve_output(
    expected: &ExpectedOutput,
    project_id: i64,
    files: &dyn ProjectFileStore,
) -> Result<Option<String>, ConfigError> {
    match expected {
        ExpectedOutput::None => Ok(None),
        ExpectedOutput::Text { text } => Ok(Some(text.clone())),
        ExpectedOutput::ProjectFile { filename } => files
            .read_string(project_id, filename)
            .await
            .map(Some)
            .map_err(|e| ConfigError::UnreadableProjectFile {
                filename: filename.clone(),
                reason: format!("{:#}", e),
            }),
    }
}

/// Expectations with every source loaded into memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedExpectations {
    pub return_code: ExpectedReturnCode,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub diff: DiffOptions,
}

impl ResolvedExpectations {
    pub fn stdout_diff(&self, actual: &str) -> Option<DiffResult> {
        self.stdout
            .as_deref()
            .map(|expected| diff::diff(expected, actual, &self.diff))
    }

    pub fn stderr_diff(&self, actual: &str) -> Option<DiffResult> {
        self.stderr
            .as_deref()
            .map(|expected| diff::diff(expected, actual, &self.diff))
    }
}

/// Stored outcome of one command, independent of any feedback policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResultRecord {
    pub result_id: i64,
    pub command_name: String,
    pub return_code: Option<i32>,
    pub timed_out: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub return_code_correct: Option<bool>,
    pub stdout_correct: Option<bool>,
    pub stderr_correct: Option<bool>,
}

/// Writes command results into one submission's output directory.
#[derive(Debug, Clone)]
pub struct CommandResultRecorder {
    output_dir: PathBuf,
}

impl CommandResultRecorder {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn stdout_path(&self, result_id: i64) -> PathBuf {
        self.output_dir
            .join(format!("cmd_result_{}_stdout", result_id))
    }

    pub fn stderr_path(&self, result_id: i64) -> PathBuf {
        self.output_dir
            .join(format!("cmd_result_{}_stderr", result_id))
    }

    /// Persist `result`'s output and compute its correctness fields.
    pub async fn record(
        &self,
        result_id: i64,
        command_name: &str,
        result: &CommandExecutionResult,
        expected: &ResolvedExpectations,
    ) -> Result<CommandResultRecord> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.output_dir.display()))?;

        let stdout_path = self.stdout_path(result_id);
        tokio::fs::write(&stdout_path, &result.stdout)
            .await
            .with_context(|| format!("Failed to write {}", stdout_path.display()))?;
        let stderr_path = self.stderr_path(result_id);
        tokio::fs::write(&stderr_path, &result.stderr)
            .await
            .with_context(|| format!("Failed to write {}", stderr_path.display()))?;

        let record = CommandResultRecord {
            result_id,
            command_name: command_name.to_string(),
            return_code: result.return_code,
            timed_out: result.timed_out,
            stdout_truncated: result.stdout_truncated,
            stderr_truncated: result.stderr_truncated,
            return_code_correct: expected.return_code.check(result.return_code),
            stdout_correct: expected
                .stdout
                .as_deref()
                .map(|e| outputs_match(e, &result.stdout_text(), &expected.diff)),
            stderr_correct: expected
                .stderr
                .as_deref()
                .map(|e| outputs_match(e, &result.stderr_text(), &expected.diff)),
        };
        debug!("Recorded command result {}: {:?}", result_id, record);
        Ok(record)
    }

    pub async fn read_stdout(&self, result_id: i64) -> Result<String> {
        read_lossy(&self.stdout_path(result_id)).await
    }

    pub async fn read_stderr(&self, result_id: i64) -> Result<String> {
        read_lossy(&self.stderr_path(result_id)).await
    }
}

/// Stored output is raw bytes; display decodes it lossily.
async fn read_lossy(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
