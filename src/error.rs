//! Error types for acquisition, filtering, detection and configuration.

use std::io;
use thiserror::Error;

/// Failure of the sample source. Always fatal to the acquisition loop.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The device did not produce a sample within the allowed time.
    #[error("sample source timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Register access on the underlying bus failed.
    #[error("bus error: {0}")]
    Bus(#[from] io::Error),

    /// A finite source ran out of samples.
    #[error("sample source exhausted after {0} samples")]
    Exhausted(u64),
}

/// Failure of a block filter invocation. Fatal for one window only.
#[derive(Error, Debug)]
pub enum FilterError {
    /// Push or pull transfer did not complete in time.
    #[error("{stage} transfer timeout after {timeout_ms}ms")]
    Timeout { stage: &'static str, timeout_ms: u64 },

    /// Output length differs from input length.
    #[error("filter length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// The accelerator engine reported an error.
    #[error("filter engine error: {0}")]
    Engine(String),

    /// Register or buffer access on the accelerator bus failed.
    #[error("accelerator bus error: {0}")]
    Bus(#[from] io::Error),
}

impl FilterError {
    /// Whether the next window may reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FilterError::Timeout { .. } | FilterError::Engine(_))
    }
}

/// Rejected detector input.
#[derive(Error, Debug)]
pub enum DetectError {
    #[error("window length mismatch: expected {expected}, got enhanced={enhanced} band={band}")]
    LengthMismatch {
        expected: usize,
        enhanced: usize,
        band: usize,
    },

    /// Windows must arrive in acquisition order.
    #[error("window {got} out of order, expected {expected} or later")]
    OutOfOrder { expected: u64, got: u64 },
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level monitor error.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("acquisition failed: {0}")]
    Source(#[from] SourceError),

    #[error("accelerator setup failed: {0}")]
    Accelerator(#[from] FilterError),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{0} thread panicked")]
    Panicked(&'static str),
}
