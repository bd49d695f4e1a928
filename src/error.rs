//! Error types for the hotplug harness

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving an assembly scenario
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Device Layer Errors
    // =========================================================================
    /// Backing file allocation or removal failed
    #[error("Backing store failure at {path}: {reason}")]
    Storage { path: String, reason: String },

    /// Attach, detach or notification command failed
    #[error("Device command '{command}' failed: {reason}")]
    Device { command: String, reason: String },

    // =========================================================================
    // Daemon Errors
    // =========================================================================
    /// Management interface is not reachable yet
    #[error("Management interface not connected: {0}")]
    NotConnected(String),

    /// Management interface returned an error
    #[error("Management interface error: {0}")]
    Management(String),

    /// Daemon did not answer within the readiness budget
    #[error("Daemon not ready after {waited:?} ({attempts} attempts)")]
    ReadinessTimeout { waited: Duration, attempts: u32 },

    /// Daemon process could not be spawned, signalled or reaped
    #[error("Daemon supervision error: {0}")]
    Daemon(String),

    // =========================================================================
    // Assembly Errors
    // =========================================================================
    /// Observed pool visibility does not match expectation
    #[error(
        "Assembly assertion failed at {step}: expected {expected} pool(s){}, observed {observed}",
        filter_suffix(.filter)
    )]
    AssemblyAssertion {
        step: String,
        filter: Option<String>,
        expected: usize,
        observed: usize,
    },
}

fn filter_suffix(filter: &Option<String>) -> String {
    filter
        .as_deref()
        .map(|name| format!(" named {name}"))
        .unwrap_or_default()
}

impl Error {
    /// Build a `Storage` error from an I/O failure on `path`.
    pub fn storage(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        Error::Storage {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }

    /// Build a `Device` error for `command`.
    pub fn device(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Device {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Only a not-yet-connected management interface is worth polling again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NotConnected(_))
    }

    /// Fatal errors abort the running scenario.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }

    /// True for the harness's primary defect signal.
    pub fn is_assembly_failure(&self) -> bool {
        matches!(self, Error::AssemblyAssertion { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_not_connected_is_retryable() {
        assert!(Error::NotConnected("bus".into()).is_retryable());
        assert!(!Error::Management("boom".into()).is_retryable());
        assert!(Error::device("losetup -d", "busy").is_fatal());
        assert!(Error::ReadinessTimeout {
            waited: Duration::from_secs(10),
            attempts: 100
        }
        .is_fatal());
    }

    #[test]
    fn test_assembly_assertion_message_names_step_and_filter() {
        let err = Error::AssemblyAssertion {
            step: "final activation".into(),
            filter: Some("stratis_ABCDE".into()),
            expected: 1,
            observed: 0,
        };
        let msg = err.to_string();
        assert!(msg.contains("final activation"));
        assert!(msg.contains("named stratis_ABCDE"));
        assert!(msg.contains("expected 1"));
        assert!(msg.contains("observed 0"));
        assert!(err.is_assembly_failure());

        let unfiltered = Error::AssemblyAssertion {
            step: "baseline".into(),
            filter: None,
            expected: 2,
            observed: 3,
        };
        assert!(!unfiltered.to_string().contains("named"));
    }
}
