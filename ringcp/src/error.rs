use nix::errno::Errno;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the copy engine.
///
/// Apart from [`EngineError::SubmissionQueueFull`], which the scheduler only
/// sees when a capacity check and a push disagree, every variant is terminal:
/// the engine has no partial-failure mode.
#[derive(Error, Debug)]
pub enum EngineError {
    // Setup errors
    #[error("Failed to set up io_uring: {source}")]
    RingSetup {
        #[source]
        source: std::io::Error,
    },

    #[error("Buffer allocation failed: requested {size} bytes")]
    BufferAllocation { size: usize },

    #[error("Buffer registration failed: {source}")]
    BufferRegistration {
        #[source]
        source: std::io::Error,
    },

    #[error("Path contains an interior NUL byte: {path}")]
    InvalidPath { path: PathBuf },

    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Failed to parse configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Transfer errors
    #[error("Submission failed: {source}")]
    Submit {
        #[source]
        source: std::io::Error,
    },

    #[error("Completion queue wait failed: {source}")]
    Wait {
        #[source]
        source: std::io::Error,
    },

    #[error("Submission queue is full")]
    SubmissionQueueFull,

    #[error("{operation} failed: {}", errno.desc())]
    OperationFailed { operation: &'static str, errno: Errno },

    #[error("Short {operation} at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortTransfer {
        operation: &'static str,
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("Source and destination are the same file: {path}")]
    SameFile { path: PathBuf },

    #[error("Completion for unknown operation id {id}")]
    UnknownOperation { id: u64 },

    #[error("No operations in flight but the transfer is unfinished ({bytes_remaining} bytes left to read, {pending_writes} writes pending)")]
    Stalled {
        bytes_remaining: u64,
        pending_writes: usize,
    },
}

impl EngineError {
    /// Build the error for a completion that reported `-errno`.
    pub fn operation_failed(operation: &'static str, result: i32) -> Self {
        EngineError::OperationFailed {
            operation,
            errno: Errno::from_i32(-result),
        }
    }

    /// Whether the failure happened before any data could move.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            EngineError::RingSetup { .. }
                | EngineError::BufferAllocation { .. }
                | EngineError::BufferRegistration { .. }
                | EngineError::InvalidPath { .. }
                | EngineError::InvalidConfiguration { .. }
                | EngineError::Config(_)
                | EngineError::Io(_)
        )
    }

    /// Convert to exit code for CLI applications
    pub fn exit_code(&self) -> i32 {
        if self.is_setup_error() {
            1
        } else {
            2
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
