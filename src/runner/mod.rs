//! Runner module - single external process execution
//!
//! Launches one command, feeds it stdin, captures stdout/stderr up to a fixed
//! length and enforces a wall-clock timeout.
//!
//! The runner module does NOT:
//! - Compare outputs or decide correctness
//! - Know about containers (the sandbox wraps commands before they get here)
//! - Distinguish resource-limit kills from other signals

pub mod output;
pub mod process;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::constants::{
    DEFAULT_PROCESS_LIMIT, DEFAULT_STACK_SIZE_LIMIT, DEFAULT_VIRTUAL_MEM_LIMIT,
    MAX_PROCESS_LIMIT, MAX_STACK_SIZE_LIMIT, MAX_VIRTUAL_MEM_LIMIT,
};
use crate::core::ConfigError;

pub use output::CapturedOutput;
pub use process::{ProcessOutcome, ProcessRunner};

/// Command specification for execution
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Environment variables (key, value)
    pub env: Vec<(String, String)>,
    /// Working directory
    pub work_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            work_dir: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Create from a command vector (first element is program, rest are args)
    pub fn from_vec(cmd: &[String]) -> Self {
        let mut iter = cmd.iter();
        let program = iter.next().cloned().unwrap_or_default();
        Self::new(program).with_args(iter.cloned())
    }

    /// Convert to a vector of strings (program + args)
    pub fn to_vec(&self) -> Vec<String> {
        let mut v = vec![self.program.clone()];
        v.extend(self.args.iter().cloned());
        v
    }
}

/// OS resource limits applied to one command.
///
/// Sizes are in bytes. `max_num_processes == 0` means no process cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_stack_size: u64,
    pub max_virtual_memory: u64,
    pub max_num_processes: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_stack_size: DEFAULT_STACK_SIZE_LIMIT,
            max_virtual_memory: DEFAULT_VIRTUAL_MEM_LIMIT,
            max_num_processes: DEFAULT_PROCESS_LIMIT,
        }
    }
}

impl ResourceLimits {
    /// Check every limit against its platform range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("max_stack_size", self.max_stack_size, 1, MAX_STACK_SIZE_LIMIT)?;
        check_range(
            "max_virtual_memory",
            self.max_virtual_memory,
            1,
            MAX_VIRTUAL_MEM_LIMIT,
        )?;
        check_range(
            "max_num_processes",
            u64::from(self.max_num_processes),
            0,
            u64::from(MAX_PROCESS_LIMIT),
        )
    }

    /// Limits for a single invocation; `self` is left untouched.
    pub fn with_overrides(&self, overrides: &LimitOverrides) -> Self {
        Self {
            max_stack_size: overrides.max_stack_size.unwrap_or(self.max_stack_size),
            max_virtual_memory: overrides
                .max_virtual_memory
                .unwrap_or(self.max_virtual_memory),
            max_num_processes: overrides
                .max_num_processes
                .unwrap_or(self.max_num_processes),
        }
    }
}

/// Per-command overrides of the sandbox defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverrides {
    #[serde(default)]
    pub max_stack_size: Option<u64>,
    #[serde(default)]
    pub max_virtual_memory: Option<u64>,
    #[serde(default)]
    pub max_num_processes: Option<u32>,
}

pub(crate) fn check_range(
    field: &'static str,
    value: u64,
    min: u64,
    max: u64,
) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            min,
            max,
            value,
        })
    }
}
