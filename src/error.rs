use std::fmt;

/// Errors produced by the driver layer.
///
/// Every error returned from `start`/`open` is terminal for that call: the
/// driver never retries internally. Retry and backoff policy belongs to the
/// scheduler that placed the task.
//
// Implemented by hand rather than with `#[derive(thiserror::Error)]` because
// the `Fetch` variant's `source` field is a URL string, not a nested error,
// and thiserror unconditionally treats a field named `source` as the error
// source (which requires it to implement `std::error::Error`).
#[derive(Debug)]
pub enum DriverError {
    Configuration(String),

    Resource(String),

    Fetch { source: String, reason: String },

    Integrity { expected: String, actual: String },

    Spawn { program: String, reason: String },

    HandleDecode { handle_id: String, reason: String },

    ProcessNotFound(i32),

    Signal { pid: i32, reason: String },

    Wait(String),

    Fingerprint(String),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "Invalid task configuration: {msg}"),
            Self::Resource(msg) => write!(f, "Missing required task resource: {msg}"),
            Self::Fetch { source, reason } => {
                write!(f, "Failed to fetch artifact from {source}: {reason}")
            }
            Self::Integrity { expected, actual } => {
                write!(f, "Artifact checksum mismatch: expected {expected}, got {actual}")
            }
            Self::Spawn { program, reason } => {
                write!(f, "Failed to spawn {program}: {reason}")
            }
            Self::HandleDecode { handle_id, reason } => {
                write!(f, "Failed to decode handle id {handle_id:?}: {reason}")
            }
            Self::ProcessNotFound(pid) => write!(f, "Process {pid} not found"),
            Self::Signal { pid, reason } => {
                write!(f, "Failed to signal process {pid}: {reason}")
            }
            Self::Wait(msg) => write!(f, "Task exited abnormally: {msg}"),
            Self::Fingerprint(msg) => write!(f, "Fingerprint failed: {msg}"),
        }
    }
}

impl std::error::Error for DriverError {}

pub type Result<T> = std::result::Result<T, DriverError>;
