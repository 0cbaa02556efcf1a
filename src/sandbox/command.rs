//! Command requests and results exchanged with a sandbox.

use std::borrow::Cow;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::constants::{
    DEFAULT_SUBPROCESS_TIMEOUT, MAX_SUBPROCESS_TIMEOUT, SUPPORTED_COMPILERS,
    SUPPORTED_INTERPRETERS,
};
use crate::core::ConfigError;
use crate::runner::{check_range, LimitOverrides, ProcessOutcome, ResourceLimits};

/// What to run. Each variant carries only the fields it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandProgram {
    /// Compile `files` into `executable_name`
    Compile {
        compiler: String,
        #[serde(default)]
        compiler_flags: Vec<String>,
        files: Vec<String>,
        executable_name: String,
    },
    /// Run an executable produced by an earlier `Compile`
    Compiled {
        executable_name: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Interpreted {
        interpreter: String,
        #[serde(default)]
        interpreter_flags: Vec<String>,
        entry_point: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Instructor-written shell command line
    Shell { cmd: String },
}

impl CommandProgram {
    /// Build the argument vector.
    pub fn argv(&self) -> Vec<String> {
        match self {
            CommandProgram::Compile {
                compiler,
                compiler_flags,
                files,
                executable_name,
            } => {
                let mut argv = vec![compiler.clone()];
                argv.extend(compiler_flags.iter().cloned());
                argv.extend(files.iter().cloned());
                argv.push("-o".to_string());
                argv.push(executable_name.clone());
                argv
            }
            CommandProgram::Compiled {
                executable_name,
                args,
            } => {
                let mut argv = vec![format!("./{}", executable_name)];
                argv.extend(args.iter().cloned());
                argv
            }
            CommandProgram::Interpreted {
                interpreter,
                interpreter_flags,
                entry_point,
                args,
            } => {
                let mut argv = vec![interpreter.clone()];
                argv.extend(interpreter_flags.iter().cloned());
                argv.push(entry_point.clone());
                argv.extend(args.iter().cloned());
                argv
            }
            CommandProgram::Shell { cmd } => {
                vec!["sh".to_string(), "-c".to_string(), cmd.clone()]
            }
        }
    }

    pub fn is_compile(&self) -> bool {
        matches!(self, CommandProgram::Compile { .. })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            CommandProgram::Compile {
                compiler,
                files,
                executable_name,
                ..
            } => {
                if !SUPPORTED_COMPILERS.contains(&compiler.as_str()) {
                    return Err(ConfigError::Unsupported {
                        kind: "compiler",
                        name: compiler.clone(),
                    });
                }
                if files.is_empty() {
                    return Err(ConfigError::Invalid(
                        "at least one file must be specified for compilation".to_string(),
                    ));
                }
                for file in files {
                    validate_filename(file)?;
                }
                validate_filename(executable_name)
            }
            CommandProgram::Compiled {
                executable_name, ..
            } => validate_filename(executable_name),
            CommandProgram::Interpreted {
                interpreter,
                entry_point,
                ..
            } => {
                if !SUPPORTED_INTERPRETERS.contains(&interpreter.as_str()) {
                    return Err(ConfigError::Unsupported {
                        kind: "interpreter",
                        name: interpreter.clone(),
                    });
                }
                validate_filename(entry_point)
            }
            CommandProgram::Shell { cmd } => {
                if cmd.trim().is_empty() {
                    Err(ConfigError::Invalid("command can't be empty".to_string()))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Reject empty names and anything that could escape the working directory.
pub fn validate_filename(name: &str) -> Result<(), ConfigError> {
    if name.is_empty()
        || name == "."
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.contains('\0')
    {
        return Err(ConfigError::InvalidFilename(name.to_string()));
    }
    Ok(())
}

/// One command to run inside an active sandbox. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandExecutionRequest {
    pub program: CommandProgram,
    pub stdin: Option<String>,
    pub timeout: Duration,
    /// Applied to this invocation only
    pub limits: LimitOverrides,
}

impl CommandExecutionRequest {
    pub fn new(program: CommandProgram) -> Self {
        Self {
            program,
            stdin: None,
            timeout: Duration::from_secs(DEFAULT_SUBPROCESS_TIMEOUT),
            limits: LimitOverrides::default(),
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_limits(mut self, limits: LimitOverrides) -> Self {
        self.limits = limits;
        self
    }

    pub fn argv(&self) -> Vec<String> {
        self.program.argv()
    }

    /// Validate against the platform ranges, given the sandbox defaults.
    pub fn validate(&self, defaults: &ResourceLimits) -> Result<(), ConfigError> {
        self.program.validate()?;
        check_range(
            "timeout",
            self.timeout.as_secs(),
            1,
            MAX_SUBPROCESS_TIMEOUT,
        )?;
        defaults.with_overrides(&self.limits).validate()
    }
}

/// Output of one command. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandExecutionResult {
    /// `None` if the process never completed (timeout)
    pub return_code: Option<i32>,
    /// Raw output, exactly as written by the process
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl From<ProcessOutcome> for CommandExecutionResult {
    fn from(outcome: ProcessOutcome) -> Self {
        Self {
            return_code: outcome.return_code,
            stdout: outcome.stdout.bytes,
            stderr: outcome.stderr.bytes,
            timed_out: outcome.timed_out,
            stdout_truncated: outcome.stdout.truncated,
            stderr_truncated: outcome.stderr.truncated,
        }
    }
}

impl CommandExecutionResult {
    /// Exited normally with status 0
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.return_code == Some(0)
    }

    pub fn stdout_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}
