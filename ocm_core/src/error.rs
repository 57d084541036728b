//! Unified error handling for the OCM runtime.
//!
//! One error enum covers the whole crate so that task, IPC, and orchestrator
//! code can propagate failures with `?` without per-module conversion noise.
//!
//! Two conditions from the runtime's contracts are deliberately *not* errors:
//! a timed-out semaphore wait and a node answering "not yet" to an
//! enter/exit probe. Both are plain booleans at the call site.

use thiserror::Error;

/// Main error type for OCM operations.
#[derive(Debug, Error)]
pub enum OcmError {
    /// I/O related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration validation errors: duplicate names, unknown references,
    /// empty required fields. Fatal at boot.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Named OS resource failures: semaphore or shared-memory syscalls,
    /// size mismatch on a pre-existing buffer. Fatal for the affected
    /// topic or task.
    #[error("Resource error: {0}")]
    Resource(String),

    /// Lookup of a name that was never registered.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A user node's lifecycle call failed.
    #[error("Node '{node}' error: {message}")]
    Node { node: String, message: String },

    /// Invalid argument from the embedding application.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization/deserialization of a topic payload failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_yaml::Error> for OcmError {
    fn from(err: serde_yaml::Error) -> Self {
        OcmError::Config(format!("YAML error: {err}"))
    }
}

/// Convenience alias used throughout the crate.
pub type OcmResult<T> = std::result::Result<T, OcmError>;

impl OcmError {
    /// Create a configuration error with a custom message.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        OcmError::Config(msg.into())
    }

    /// Create a resource error with a custom message.
    pub fn resource<S: Into<String>>(msg: S) -> Self {
        OcmError::Resource(msg.into())
    }

    /// Create a node error with node name and message.
    pub fn node<S: Into<String>, T: Into<String>>(node: S, message: T) -> Self {
        OcmError::Node {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Resource error carrying the current `errno` description.
    ///
    /// Used after a failed libc call; the OS error must be read before any
    /// intervening syscall.
    pub fn last_os<S: Into<String>>(what: S) -> Self {
        OcmError::Resource(format!(
            "{}: {}",
            what.into(),
            std::io::Error::last_os_error()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = OcmError::node("imu", "sensor offline");
        assert_eq!(err.to_string(), "Node 'imu' error: sensor offline");

        let err = OcmError::config("empty task name");
        assert!(err.to_string().contains("empty task name"));
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: OcmError = io.into();
        assert!(matches!(err, OcmError::Io(_)));
    }
}
