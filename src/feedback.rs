//! Feedback calculator
//!
//! Pure projection of a stored [`CommandResultRecord`] through a feedback
//! policy. Hidden fields come back as `None` (or zero for points).

use serde::{Deserialize, Serialize};

use crate::recorder::{CommandResultRecord, CommandResultRecorder, ExpectedReturnCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackCategory {
    Normal,
    UltimateSubmission,
    PastLimitSubmission,
    StaffViewer,
    /// Everything visible; not configurable
    Max,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueFeedbackLevel {
    #[default]
    NoFeedback,
    CorrectOrIncorrect,
    ExpectedAndActual,
}

/// What one feedback category reveals about a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandFeedbackConfig {
    pub return_code_fdbk_level: ValueFeedbackLevel,
    pub stdout_fdbk_level: ValueFeedbackLevel,
    pub stderr_fdbk_level: ValueFeedbackLevel,
    pub show_points: bool,
    pub show_actual_return_code: bool,
    pub show_actual_stdout: bool,
    pub show_actual_stderr: bool,
    pub show_whether_timed_out: bool,
}

impl CommandFeedbackConfig {
    pub fn max() -> Self {
        Self {
            return_code_fdbk_level: ValueFeedbackLevel::ExpectedAndActual,
            stdout_fdbk_level: ValueFeedbackLevel::ExpectedAndActual,
            stderr_fdbk_level: ValueFeedbackLevel::ExpectedAndActual,
            show_points: true,
            show_actual_return_code: true,
            show_actual_stdout: true,
            show_actual_stderr: true,
            show_whether_timed_out: true,
        }
    }
}

/// Per-category configs of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfigs {
    pub normal: CommandFeedbackConfig,
    pub ultimate_submission: CommandFeedbackConfig,
    pub past_limit_submission: CommandFeedbackConfig,
    pub staff_viewer: CommandFeedbackConfig,
}

impl FeedbackConfigs {
    pub fn for_category(&self, category: FeedbackCategory) -> CommandFeedbackConfig {
        match category {
            FeedbackCategory::Normal => self.normal,
            FeedbackCategory::UltimateSubmission => self.ultimate_submission,
            FeedbackCategory::PastLimitSubmission => self.past_limit_submission,
            FeedbackCategory::StaffViewer => self.staff_viewer,
            FeedbackCategory::Max => CommandFeedbackConfig::max(),
        }
    }
}

/// Points awarded per checked field. Deductions are zero or negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandPoints {
    pub points_for_correct_return_code: i32,
    pub points_for_correct_stdout: i32,
    pub points_for_correct_stderr: i32,
    pub deduction_for_wrong_return_code: i32,
    pub deduction_for_wrong_stdout: i32,
    pub deduction_for_wrong_stderr: i32,
}

/// Command settings the calculator needs besides the stored result.
#[derive(Debug, Clone, Copy)]
pub struct CommandFeedbackSettings<'a> {
    pub expected_return_code: ExpectedReturnCode,
    pub points: &'a CommandPoints,
    pub configs: &'a FeedbackConfigs,
}

/// Masked view of one command result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFeedback {
    pub result_id: i64,
    pub command_name: String,
    pub fdbk_settings: CommandFeedbackConfig,

    pub timed_out: Option<bool>,

    pub return_code_correct: Option<bool>,
    pub expected_return_code: Option<ExpectedReturnCode>,
    pub actual_return_code: Option<i32>,
    pub return_code_points: i32,
    pub return_code_points_possible: i32,

    pub stdout_correct: Option<bool>,
    /// Actual stdout may be shown
    pub show_stdout: bool,
    /// Expected-vs-actual diff may be shown
    pub show_stdout_diff: bool,
    pub stdout_points: i32,
    pub stdout_points_possible: i32,

    pub stderr_correct: Option<bool>,
    pub show_stderr: bool,
    pub show_stderr_diff: bool,
    pub stderr_points: i32,
    pub stderr_points_possible: i32,

    pub total_points: i32,
    pub total_points_possible: i32,
}

impl CommandFeedback {
    /// Load stdout from the recorder's files if this view may show it
    pub async fn stdout(&self, recorder: &CommandResultRecorder) -> anyhow::Result<Option<String>> {
        if !self.show_stdout {
            return Ok(None);
        }
        recorder.read_stdout(self.result_id).await.map(Some)
    }

    pub async fn stderr(&self, recorder: &CommandResultRecorder) -> anyhow::Result<Option<String>> {
        if !self.show_stderr {
            return Ok(None);
        }
        recorder.read_stderr(self.result_id).await.map(Some)
    }
}

pub struct FeedbackCalculator;

impl FeedbackCalculator {
    pub fn calculate(
        record: &CommandResultRecord,
        settings: &CommandFeedbackSettings<'_>,
        category: FeedbackCategory,
    ) -> CommandFeedback {
        let fdbk = settings.configs.for_category(category);
        let points = settings.points;

        let return_code_correct = reveal(record.return_code_correct, fdbk.return_code_fdbk_level);
        let stdout_correct = reveal(record.stdout_correct, fdbk.stdout_fdbk_level);
        let stderr_correct = reveal(record.stderr_correct, fdbk.stderr_fdbk_level);

        let (return_code_points, return_code_points_possible) = score(
            return_code_correct,
            points.points_for_correct_return_code,
            points.deduction_for_wrong_return_code,
        );
        let (stdout_points, stdout_points_possible) = score(
            stdout_correct,
            points.points_for_correct_stdout,
            points.deduction_for_wrong_stdout,
        );
        let (stderr_points, stderr_points_possible) = score(
            stderr_correct,
            points.points_for_correct_stderr,
            points.deduction_for_wrong_stderr,
        );

        let (total_points, total_points_possible) = if fdbk.show_points {
            (
                return_code_points + stdout_points + stderr_points,
                return_code_points_possible + stdout_points_possible + stderr_points_possible,
            )
        } else {
            (0, 0)
        };

        let full = ValueFeedbackLevel::ExpectedAndActual;
        CommandFeedback {
            result_id: record.result_id,
            command_name: record.command_name.clone(),
            fdbk_settings: fdbk,

            timed_out: fdbk.show_whether_timed_out.then_some(record.timed_out),

            return_code_correct,
            expected_return_code: (fdbk.return_code_fdbk_level == full)
                .then_some(settings.expected_return_code),
            actual_return_code: if fdbk.show_actual_return_code
                || fdbk.return_code_fdbk_level == full
            {
                record.return_code
            } else {
                None
            },
            return_code_points,
            return_code_points_possible,

            stdout_correct,
            show_stdout: fdbk.show_actual_stdout || fdbk.stdout_fdbk_level == full,
            show_stdout_diff: record.stdout_correct.is_some() && fdbk.stdout_fdbk_level == full,
            stdout_points,
            stdout_points_possible,

            stderr_correct,
            show_stderr: fdbk.show_actual_stderr || fdbk.stderr_fdbk_level == full,
            show_stderr_diff: record.stderr_correct.is_some() && fdbk.stderr_fdbk_level == full,
            stderr_points,
            stderr_points_possible,

            total_points,
            total_points_possible,
        }
    }
}

/// Unchecked fields stay `None`; checked fields need at least correct/incorrect feedback.
fn reveal(correct: Option<bool>, level: ValueFeedbackLevel) -> Option<bool> {
    if level == ValueFeedbackLevel::NoFeedback {
        None
    } else {
        correct
    }
}

/// (points, points possible) for one revealed field
fn score(correct: Option<bool>, for_correct: i32, deduction: i32) -> (i32, i32) {
    match correct {
        None => (0, 0),
        Some(true) => (for_correct, for_correct),
        Some(false) => (deduction, for_correct),
    }
}
