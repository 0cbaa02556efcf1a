//! Platform constants for command execution and sandbox limits.

/// Maximum number of characters kept from a single output stream.
pub const MAX_OUTPUT_LENGTH: usize = 8_000_000;

/// For a given project, the directory that uploaded project files live in.
pub const PROJECT_FILES_DIRNAME: &str = "project_files";

/// For a given submission, the directory that command output files live in.
pub const RESULT_OUTPUT_DIRNAME: &str = "output";

pub const SUPPORTED_COMPILERS: &[&str] = &["g++", "clang++", "gcc", "clang"];

pub const SUPPORTED_INTERPRETERS: &[&str] = &["python", "python3", "bash"];

// Command timeouts, in seconds
pub const DEFAULT_SUBPROCESS_TIMEOUT: u64 = 10;
pub const MAX_SUBPROCESS_TIMEOUT: u64 = 60;

pub const DEFAULT_SANDBOX_IMAGE: &str = "jameslp/autograder-sandbox";

pub const DEFAULT_STACK_SIZE_LIMIT: u64 = 10_000_000; // 10 MB
pub const MAX_STACK_SIZE_LIMIT: u64 = 100_000_000; // 100 MB

pub const DEFAULT_VIRTUAL_MEM_LIMIT: u64 = 500_000_000; // 500 MB
pub const MAX_VIRTUAL_MEM_LIMIT: u64 = 1_000_000_000; // 1 GB

/// 0 means "no special cap".
pub const DEFAULT_PROCESS_LIMIT: u32 = 0;
pub const MAX_PROCESS_LIMIT: u32 = 10;

/// CPU share for image builds: half of one core.
pub const IMAGE_BUILD_CPU_PERIOD: u32 = 100_000;
pub const IMAGE_BUILD_CPU_QUOTA: u32 = 50_000;

/// Commands sandbox images are allowed to declare as their default CMD.
pub const ALLOWED_IMAGE_CMDS: &[&[&str]] = &[&["/bin/bash"], &["/bin/sh"]];
