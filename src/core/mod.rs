//! Shared constants and error types used across the worker.

pub mod constants;
pub mod error;

pub use error::{CommandFailed, ConfigError, StoreError};
