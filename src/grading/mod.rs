//! Grading module - run a submission's test cases in a sandbox
//!
//! All command configuration is validated and every project-file input is
//! resolved before the first command runs, so configuration errors surface
//! before any work is done. Commands then run strictly in order inside one
//! sandbox; each result is recorded as soon as it is available.

pub mod job;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::GraderConfig;
use crate::core::ConfigError;
use crate::feedback::{CommandFeedbackSettings, FeedbackCalculator};
use crate::recorder::{CommandResultRecorder, ResolvedExpectations};
use crate::sandbox::{self, Sandbox, SandboxOptions};
use crate::storage::ProjectFileStore;

pub use job::{
    CommandReport, GradedCommand, GradingJob, GradingResult, GradingStatus, StdinSource,
    SubmittedFile, TestCaseResult, TestCaseSpec,
};

/// Everything a grading run needs besides the sandbox.
pub struct SubmissionContext<'a> {
    pub job: &'a GradingJob,
    pub files: &'a dyn ProjectFileStore,
    pub recorder: CommandResultRecorder,
}

/// A command with its inputs loaded.
struct PreparedCommand<'a> {
    command: &'a GradedCommand,
    stdin: Option<String>,
    expected: ResolvedExpectations,
}

async fn prepare<'a>(
    ctx: &SubmissionContext<'a>,
    sandbox: &dyn Sandbox,
) -> Result<Vec<Vec<PreparedCommand<'a>>>, ConfigError> {
    let project_id = ctx.job.project_id;
    let mut prepared = Vec::with_capacity(ctx.job.test_cases.len());
    for test_case in &ctx.job.test_cases {
        let mut commands = Vec::with_capacity(test_case.commands.len());
        for command in &test_case.commands {
            command
                .request(None)
                .validate(&sandbox.handle().limits)?;
            commands.push(PreparedCommand {
                command,
                stdin: command.stdin.resolve(project_id, ctx.files).await?,
                expected: command.expected.resolve(project_id, ctx.files).await?,
            });
        }
        prepared.push(commands);
    }
    Ok(prepared)
}

/// Run every test case of the submission in `sandbox`.
///
/// A failed compile step skips the rest of its test case. A command the
/// sandbox could not run is reported with an error and the run continues.
pub async fn run(ctx: &SubmissionContext<'_>, sandbox: &dyn Sandbox) -> Result<Vec<TestCaseResult>> {
    let prepared = prepare(ctx, sandbox).await?;
    let category = ctx.job.feedback_category;

    let mut results = Vec::with_capacity(prepared.len());
    for (spec, commands) in ctx.job.test_cases.iter().zip(prepared) {
        let mut reports = Vec::with_capacity(commands.len());
        let mut compile_failed = false;

        for prepared in commands {
            let command = prepared.command;
            let mut report = CommandReport {
                result_id: command.result_id,
                name: command.name.clone(),
                record: None,
                feedback: None,
                stdout: None,
                stderr: None,
                stdout_diff: None,
                stderr_diff: None,
                skipped: compile_failed,
                error_message: None,
            };
            if compile_failed {
                reports.push(report);
                continue;
            }

            let request = command.request(prepared.stdin);
            match sandbox.run_command(&request).await {
                Ok(result) => {
                    if command.program.is_compile() && !result.succeeded() {
                        info!(
                            "Compile step {:?} of {:?} failed, skipping the rest",
                            command.name, spec.name
                        );
                        compile_failed = true;
                    }
                    let record = ctx
                        .recorder
                        .record(command.result_id, &command.name, &result, &prepared.expected)
                        .await?;
                    let settings = CommandFeedbackSettings {
                        expected_return_code: command.expected.return_code,
                        points: &command.points,
                        configs: &command.feedback,
                    };
                    let feedback = FeedbackCalculator::calculate(&record, &settings, category);
                    report.stdout = feedback.stdout(&ctx.recorder).await?;
                    report.stderr = feedback.stderr(&ctx.recorder).await?;
                    if feedback.show_stdout_diff {
                        report.stdout_diff = prepared.expected.stdout_diff(&result.stdout_text());
                    }
                    if feedback.show_stderr_diff {
                        report.stderr_diff = prepared.expected.stderr_diff(&result.stderr_text());
                    }
                    report.feedback = Some(feedback);
                    report.record = Some(record);
                }
                Err(e) => {
                    warn!("Command {:?} could not be run: {:?}", command.name, e);
                    report.error_message = Some(format!("{:#}", e));
                }
            }
            reports.push(report);
        }

        results.push(TestCaseResult {
            name: spec.name.clone(),
            commands: reports,
        });
    }
    Ok(results)
}

/// Grade `job` end to end: stage files, acquire a sandbox, run, tear down.
pub async fn grade(
    job: &GradingJob,
    config: &GraderConfig,
    files: &dyn ProjectFileStore,
) -> GradingResult {
    match grade_inner(job, config, files).await {
        Ok(test_cases) => GradingResult {
            submission_id: job.submission_id,
            status: GradingStatus::Finished,
            test_cases,
            error_message: None,
        },
        Err(e) => {
            let status = if e.downcast_ref::<ConfigError>().is_some() {
                GradingStatus::ConfigError
            } else {
                GradingStatus::Error
            };
            warn!("Grading submission {} failed: {:?}", job.submission_id, e);
            GradingResult::failed(job.submission_id, status, format!("{:#}", e))
        }
    }
}

async fn grade_inner(
    job: &GradingJob,
    config: &GraderConfig,
    files: &dyn ProjectFileStore,
) -> Result<Vec<TestCaseResult>> {
    let staging = tempfile::tempdir().context("Failed to create staging directory")?;
    let staged = stage_files(job, files, staging.path()).await?;

    let options = SandboxOptions {
        image: job
            .sandbox_image
            .clone()
            .unwrap_or_else(|| config.default_sandbox_image.clone()),
        allow_network_access: job.allow_network_access,
        ..SandboxOptions::new("")
    };
    let mut sandbox = sandbox::acquire(&options, config).await?;

    let ctx = SubmissionContext {
        job,
        files,
        recorder: CommandResultRecorder::new(config.result_output_dir(job.submission_id)),
    };
    let outcome = match sandbox.add_files(&staged).await {
        Ok(()) => run(&ctx, sandbox.as_ref()).await,
        Err(e) => Err(e),
    };

    if let Err(e) = sandbox.teardown().await {
        warn!("Failed to tear down sandbox {}: {:?}", sandbox.handle().id, e);
    }
    outcome
}

/// Write submitted files and fetch resource files into `dir`.
async fn stage_files(
    job: &GradingJob,
    files: &dyn ProjectFileStore,
    dir: &std::path::Path,
) -> Result<Vec<PathBuf>> {
    let mut staged = Vec::with_capacity(job.files.len() + job.resource_files.len());
    for file in &job.files {
        let path = dir.join(&file.name);
        tokio::fs::write(&path, file.decode()?)
            .await
            .with_context(|| format!("Failed to stage {}", file.name))?;
        staged.push(path);
    }
    for name in &job.resource_files {
        let path = files
            .fetch_to(job.project_id, name, dir)
            .await
            .map_err(|e| ConfigError::UnreadableProjectFile {
                filename: name.clone(),
                reason: format!("{:#}", e),
            })?;
        staged.push(path);
    }
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxBackend;
    use crate::recorder::{ExpectedOutput, ExpectedReturnCode, Expectations};
    use crate::sandbox::{CommandProgram, LocalSandbox};
    use crate::storage::LocalProjectFiles;

    fn shell(result_id: i64, cmd: &str) -> GradedCommand {
        GradedCommand {
            result_id,
            name: format!("cmd {}", result_id),
            program: CommandProgram::Shell { cmd: cmd.into() },
            stdin: StdinSource::None,
            timeout_secs: 10,
            limits: Default::default(),
            expected: Expectations::default(),
            points: Default::default(),
            feedback: Default::default(),
        }
    }

    fn job(test_cases: Vec<TestCaseSpec>) -> GradingJob {
        GradingJob {
            submission_id: 5,
            project_id: 2,
            files: Vec::new(),
            resource_files: Vec::new(),
            sandbox_image: None,
            allow_network_access: false,
            feedback_category: crate::feedback::FeedbackCategory::Max,
            test_cases,
        }
    }

    #[tokio::test]
    async fn test_run_records_each_command() {
        let out = tempfile::tempdir().unwrap();
        let files = LocalProjectFiles::new(out.path().join("projects"));
        let mut echo = shell(1, "echo hello");
        echo.expected = Expectations {
            return_code: ExpectedReturnCode::Zero,
            stdout: ExpectedOutput::Text {
                text: "hello\n".into(),
            },
            ..Default::default()
        };
        let mut cat = shell(2, "cat");
        cat.stdin = StdinSource::Text {
            text: "piped".into(),
        };
        let job = job(vec![TestCaseSpec {
            name: "basics".into(),
            commands: vec![echo, cat],
        }]);

        let ctx = SubmissionContext {
            job: &job,
            files: &files,
            recorder: CommandResultRecorder::new(out.path().join("output")),
        };
        let sandbox = LocalSandbox::start(&SandboxOptions::new("unused")).unwrap();
        let results = run(&ctx, &sandbox).await.unwrap();

        let commands = &results[0].commands;
        let first = commands[0].record.as_ref().unwrap();
        assert_eq!(first.return_code_correct, Some(true));
        assert_eq!(first.stdout_correct, Some(true));
        assert_eq!(commands[0].feedback.as_ref().unwrap().total_points, 0);
        assert_eq!(ctx.recorder.read_stdout(2).await.unwrap(), "piped");
    }

    #[tokio::test]
    async fn test_failed_compile_skips_rest_of_test_case() {
        let out = tempfile::tempdir().unwrap();
        let files = LocalProjectFiles::new(out.path());
        // a compiler that always fails
        let bin = out.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::os::unix::fs::symlink("/bin/false", bin.join("gcc")).unwrap();
        let path = format!(
            "{}:{}",
            bin.display(),
            std::env::var("PATH").unwrap_or_default()
        );

        let compile = GradedCommand {
            program: CommandProgram::Compile {
                compiler: "gcc".into(),
                compiler_flags: vec![],
                files: vec!["main.c".into()],
                executable_name: "prog".into(),
            },
            ..shell(1, "unused")
        };
        let job = job(vec![
            TestCaseSpec {
                name: "compiles".into(),
                commands: vec![compile, shell(2, "echo never")],
            },
            TestCaseSpec {
                name: "independent".into(),
                commands: vec![shell(3, "echo still runs")],
            },
        ]);

        let ctx = SubmissionContext {
            job: &job,
            files: &files,
            recorder: CommandResultRecorder::new(out.path().join("output")),
        };
        let sandbox = LocalSandbox::start(&SandboxOptions::new("unused"))
            .unwrap()
            .with_env("PATH", path);
        let results = run(&ctx, &sandbox).await.unwrap();

        let first = &results[0].commands;
        assert_eq!(first[0].record.as_ref().unwrap().return_code, Some(1));
        assert!(!first[0].skipped);
        assert!(first[1].skipped);
        assert!(first[1].record.is_none());
        assert!(first[1].error_message.is_none());
        assert!(!ctx.recorder.stdout_path(2).exists());

        let other = &results[1].commands[0];
        assert!(!other.skipped);
        assert_eq!(other.record.as_ref().unwrap().return_code, Some(0));
    }

    #[tokio::test]
    async fn test_report_shows_output_and_diff_per_feedback() {
        let out = tempfile::tempdir().unwrap();
        let files = LocalProjectFiles::new(out.path());
        let mut command = shell(1, "printf 'one\\ntwo\\n'; echo oops >&2");
        command.expected.stdout = ExpectedOutput::Text {
            text: "one\nthree\n".into(),
        };
        let mut hidden = shell(2, "echo secret");
        hidden.expected.stdout = ExpectedOutput::Text {
            text: "secret\n".into(),
        };
        let mut job = job(vec![TestCaseSpec {
            name: "t".into(),
            commands: vec![command, hidden],
        }]);
        job.feedback_category = crate::feedback::FeedbackCategory::Normal;
        job.test_cases[0].commands[0].feedback.normal = crate::feedback::CommandFeedbackConfig::max();

        let ctx = SubmissionContext {
            job: &job,
            files: &files,
            recorder: CommandResultRecorder::new(out.path().join("output")),
        };
        let sandbox = LocalSandbox::start(&SandboxOptions::new("unused")).unwrap();
        let results = run(&ctx, &sandbox).await.unwrap();

        let shown = &results[0].commands[0];
        assert_eq!(shown.stdout.as_deref(), Some("one\ntwo\n"));
        assert_eq!(shown.stderr.as_deref(), Some("oops\n"));
        let diff = shown.stdout_diff.as_ref().unwrap();
        assert!(!diff.diff_pass);
        assert!(diff.diff_content.contains(&"- three".to_string()));
        assert!(diff.diff_content.contains(&"+ two".to_string()));
        // nothing expected on stderr, so there is nothing to diff
        assert!(shown.stderr_diff.is_none());

        let masked = &results[0].commands[1];
        assert_eq!(masked.record.as_ref().unwrap().stdout_correct, Some(true));
        assert!(masked.stdout.is_none());
        assert!(masked.stdout_diff.is_none());
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_is_recorded_byte_for_byte() {
        let out = tempfile::tempdir().unwrap();
        let files = LocalProjectFiles::new(out.path());
        let job = job(vec![TestCaseSpec {
            name: "t".into(),
            commands: vec![shell(1, "printf 'a\\377\\376b'")],
        }]);
        let ctx = SubmissionContext {
            job: &job,
            files: &files,
            recorder: CommandResultRecorder::new(out.path().join("output")),
        };
        let sandbox = LocalSandbox::start(&SandboxOptions::new("unused")).unwrap();
        let results = run(&ctx, &sandbox).await.unwrap();

        let record = results[0].commands[0].record.as_ref().unwrap();
        assert!(!record.stdout_truncated);
        let stored = std::fs::read(ctx.recorder.stdout_path(1)).unwrap();
        assert_eq!(stored, b"a\xff\xfeb");
    }

    #[tokio::test]
    async fn test_compile_failure_skip_with_shell_stand_in() {
        // exercise the skip path without depending on a C toolchain
        let out = tempfile::tempdir().unwrap();
        let files = LocalProjectFiles::new(out.path());
        let job = job(vec![TestCaseSpec {
            name: "t".into(),
            commands: vec![shell(1, "exit 1"), shell(2, "echo runs")],
        }]);
        let ctx = SubmissionContext {
            job: &job,
            files: &files,
            recorder: CommandResultRecorder::new(out.path().join("output")),
        };
        let sandbox = LocalSandbox::start(&SandboxOptions::new("unused")).unwrap();
        let results = run(&ctx, &sandbox).await.unwrap();

        // only compile steps gate the rest of a test case
        assert!(!results[0].commands[1].skipped);
        assert_eq!(
            results[0].commands[1].record.as_ref().unwrap().return_code,
            Some(0)
        );
    }

    #[tokio::test]
    async fn test_unreadable_expected_file_is_config_error_before_running() {
        let out = tempfile::tempdir().unwrap();
        let files = LocalProjectFiles::new(out.path());
        let marker = out.path().join("ran");
        let mut command = shell(1, &format!("touch {}", marker.display()));
        command.expected.stdout = ExpectedOutput::ProjectFile {
            filename: "expected.txt".into(),
        };
        let job = job(vec![TestCaseSpec {
            name: "t".into(),
            commands: vec![command],
        }]);

        let ctx = SubmissionContext {
            job: &job,
            files: &files,
            recorder: CommandResultRecorder::new(out.path().join("output")),
        };
        let sandbox = LocalSandbox::start(&SandboxOptions::new("unused")).unwrap();
        let err = run(&ctx, &sandbox).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::UnreadableProjectFile { .. })
        ));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_grade_end_to_end_with_local_backend() {
        let root = tempfile::tempdir().unwrap();
        let config = GraderConfig {
            sandbox_backend: SandboxBackend::Local,
            results_root: root.path().join("results"),
            project_files_root: root.path().join("projects"),
            ..Default::default()
        };
        let files = LocalProjectFiles::new(&config.project_files_root);
        std::fs::create_dir_all(files.project_files_dir(2)).unwrap();
        std::fs::write(files.project_files_dir(2).join("data.txt"), "resource\n").unwrap();

        let mut job = job(vec![TestCaseSpec {
            name: "reads files".into(),
            commands: vec![shell(1, "cat answer.txt data.txt")],
        }]);
        job.files = vec![SubmittedFile {
            name: "answer.txt".into(),
            content: "NDIK".into(), // "42\n"
        }];
        job.resource_files = vec!["data.txt".into()];

        let result = grade(&job, &config, &files).await;

        assert_eq!(result.status, GradingStatus::Finished);
        let record = result.test_cases[0].commands[0].record.as_ref().unwrap();
        assert_eq!(record.return_code, Some(0));
        let stdout = std::fs::read_to_string(
            config.result_output_dir(5).join("cmd_result_1_stdout"),
        )
        .unwrap();
        assert_eq!(stdout, "42\nresource\n");
    }

    #[tokio::test]
    async fn test_grade_reports_config_errors() {
        let root = tempfile::tempdir().unwrap();
        let config = GraderConfig {
            sandbox_backend: SandboxBackend::Local,
            results_root: root.path().to_path_buf(),
            ..Default::default()
        };
        let files = LocalProjectFiles::new(root.path());
        let mut bad = shell(1, "true");
        bad.timeout_secs = 600;
        let job = job(vec![TestCaseSpec {
            name: "t".into(),
            commands: vec![bad],
        }]);

        let result = grade(&job, &config, &files).await;
        assert_eq!(result.status, GradingStatus::ConfigError);
        assert!(result.error_message.unwrap().contains("timeout"));
    }
}
