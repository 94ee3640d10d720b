//! # Warden Error Types
//!
//! Errors that can escape a sandbox operation. Expected outcomes of a command
//! (non-zero exit, timeout, resource kill) are *not* errors: they are captured
//! in [`ExecutionResult`](crate::runner::ExecutionResult). Only requests that are
//! rejected before anything runs, or operations that cannot start at all,
//! surface here.
//!
//! ## Error Categories
//!
//! - **Security**: validation rejected the request, nothing was spawned
//! - **Resource**: time, memory, CPU or size limits
//! - **Operation**: workspace lifecycle and script staging failures
//! - **System**: I/O and configuration

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Error categories for classification and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Request rejected by path or command policy
    Security,
    /// Time, memory, CPU or size limits
    Resource,
    /// Workspace or script lifecycle failures
    Operation,
    /// I/O, configuration and internal failures
    System,
}

/// Result type for all sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// E_SECURITY - Request rejected before any process was spawned
    ///
    /// Raised synchronously by path or command validation. A request that
    /// fails here is never partially executed.
    #[error("Security violation: {reason}")]
    Security {
        /// First deny reason that matched
        reason: String,
    },

    /// E_TIMEOUT - Process exceeded its wall-clock bound
    #[error("Command timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// E_RESOURCE_LIMIT - Memory or CPU cap breached under strict monitoring
    #[error("Resource limit exceeded: {reason}")]
    ResourceLimit { reason: String },

    /// E_FILE_TOO_LARGE - Content larger than the configured file size cap
    #[error("File {path} is too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge {
        path: PathBuf,
        size: u64,
        limit: u64,
    },

    /// E_EXECUTION - Runtime failure outside of the command itself
    #[error("Execution error: {message}")]
    Execution { message: String },

    /// E_WORKSPACE_NOT_FOUND - No workspace registered under this id
    #[error("Workspace '{id}' not found")]
    WorkspaceNotFound { id: String },

    /// E_WORKSPACE_EXISTS - Workspace ids are never silently reused
    #[error("Workspace '{id}' already exists")]
    WorkspaceExists { id: String },

    /// E_SESSION_NOT_FOUND - No archived session under this id
    #[error("Archived session '{session_id}' not found")]
    SessionNotFound { session_id: String },

    /// E_UNKNOWN_SCRIPT_TYPE - No run template for the declared script type
    #[error("Unsupported script type '{script_type}'. Supported types: {}", supported.join(", "))]
    UnknownScriptType {
        script_type: String,
        supported: Vec<String>,
    },

    /// E_CONFIG - Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// E_IO - I/O operation failed
    #[error("I/O error in {operation}: {source}")]
    Io {
        /// Operation that was being performed
        operation: String,
        /// Path involved in the operation (if applicable)
        path: Option<PathBuf>,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    /// Helper for an I/O error with an optional path and an operation name.
    pub fn io<P, S>(path: P, operation: S, source: std::io::Error) -> Self
    where
        P: Into<Option<PathBuf>>,
        S: Into<String>,
    {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    pub fn security<S: Into<String>>(reason: S) -> Self {
        Self::Security {
            reason: reason.into(),
        }
    }

    pub fn execution<S: Into<String>>(message: S) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Returns the error code for this error variant.
    pub fn error_code(&self) -> &'static str {
        match self {
            SandboxError::Security { .. } => "E_SECURITY",
            SandboxError::Timeout { .. } => "E_TIMEOUT",
            SandboxError::ResourceLimit { .. } => "E_RESOURCE_LIMIT",
            SandboxError::FileTooLarge { .. } => "E_FILE_TOO_LARGE",
            SandboxError::Execution { .. } => "E_EXECUTION",
            SandboxError::WorkspaceNotFound { .. } => "E_WORKSPACE_NOT_FOUND",
            SandboxError::WorkspaceExists { .. } => "E_WORKSPACE_EXISTS",
            SandboxError::SessionNotFound { .. } => "E_SESSION_NOT_FOUND",
            SandboxError::UnknownScriptType { .. } => "E_UNKNOWN_SCRIPT_TYPE",
            SandboxError::Config { .. } => "E_CONFIG",
            Self::Io { .. } => "E_IO",
        }
    }

    /// Returns the error category for taxonomic classification.
    pub fn category(&self) -> ErrorCategory {
        match self {
            SandboxError::Security { .. } => ErrorCategory::Security,
            SandboxError::Timeout { .. } => ErrorCategory::Resource,
            SandboxError::ResourceLimit { .. } => ErrorCategory::Resource,
            SandboxError::FileTooLarge { .. } => ErrorCategory::Resource,
            SandboxError::Execution { .. } => ErrorCategory::Operation,
            SandboxError::WorkspaceNotFound { .. } => ErrorCategory::Operation,
            SandboxError::WorkspaceExists { .. } => ErrorCategory::Operation,
            SandboxError::SessionNotFound { .. } => ErrorCategory::Operation,
            SandboxError::UnknownScriptType { .. } => ErrorCategory::Operation,
            SandboxError::Config { .. } => ErrorCategory::System,
            Self::Io { .. } => ErrorCategory::System,
        }
    }

    pub fn is_security(&self) -> bool {
        self.category() == ErrorCategory::Security
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_categories_line_up() {
        let err = SandboxError::security("command 'rm' is forbidden");
        assert_eq!(err.error_code(), "E_SECURITY");
        assert!(err.is_security());
        assert!(err.to_string().contains("forbidden"));

        let err = SandboxError::FileTooLarge {
            path: PathBuf::from("big.bin"),
            size: 20,
            limit: 10,
        };
        assert_eq!(err.category(), ErrorCategory::Resource);
    }

    #[test]
    fn unknown_script_type_lists_supported() {
        let err = SandboxError::UnknownScriptType {
            script_type: "cobol".into(),
            supported: vec!["python".into(), "bash".into()],
        };
        assert_eq!(
            err.to_string(),
            "Unsupported script type 'cobol'. Supported types: python, bash"
        );
    }
}
