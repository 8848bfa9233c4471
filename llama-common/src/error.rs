//! Error classification shared by the loader, chat engine, server and CLI

use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

/// Broad class of a failure, used to pick HTTP statuses, exit codes and retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input or configuration supplied by the caller
    User,
    /// Resource exhaustion or environment trouble, possibly temporary
    System,
    /// A bug in this workspace
    Internal,
    /// Failure of something we talk to over the network
    External,
}

impl ErrorCategory {
    /// HTTP status code conventionally used for this category
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCategory::User => 400,
            ErrorCategory::System => 503,
            ErrorCategory::Internal => 500,
            ErrorCategory::External => 502,
        }
    }

    /// Short machine-readable name, used as the `type` field of JSON error bodies
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::User => "invalid_request_error",
            ErrorCategory::System => "server_busy_error",
            ErrorCategory::Internal => "server_error",
            ErrorCategory::External => "upstream_error",
        }
    }
}

/// Common interface implemented by every error enum in the workspace
pub trait LlamaError: std::error::Error + Send + Sync + Debug {
    /// Get the error category for proper handling
    fn category(&self) -> ErrorCategory;

    /// Stable code identifying the failure, e.g. `CHAT_CONTEXT_EXCEEDED`
    fn error_code(&self) -> &'static str;

    /// Check if this is a user-correctable error
    fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this error is potentially retriable
    fn is_retriable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::System | ErrorCategory::External
        )
    }

    /// Message suitable for printing to a terminal
    fn user_friendly_message(&self) -> String {
        format!("{}", self)
    }

    /// Process exit status a CLI should use when it gives up on this error
    fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::User => 2,
            _ => 1,
        }
    }

    /// Custom retry delay for this error instance; `None` uses the default backoff
    fn custom_retry_delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }

    /// Check if retrying should stop regardless of attempt count
    fn should_stop_retrying(&self, _attempt: u32) -> bool {
        false
    }
}

/// Errors not owned by any one crate
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Configuration error: {message}\n💡 Check command line flags and environment variables")]
    Configuration { message: String },

    #[error("Validation error: {message}\n💡 Verify the request parameters and try again")]
    Validation { message: String },

    #[error("Timed out: {message}")]
    Timeout { message: String },

    #[error("I/O error: {0}\n💾 Check file permissions and available disk space")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {message}\n💡 This is a bug, please report it with the log output")]
    Internal { message: String },
}

impl LlamaError for CommonError {
    fn category(&self) -> ErrorCategory {
        match self {
            CommonError::Configuration { .. } | CommonError::Validation { .. } => {
                ErrorCategory::User
            }
            CommonError::Timeout { .. } | CommonError::Io(_) => ErrorCategory::System,
            CommonError::Internal { .. } => ErrorCategory::Internal,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            CommonError::Configuration { .. } => "COMMON_CONFIG",
            CommonError::Validation { .. } => "COMMON_VALIDATION",
            CommonError::Timeout { .. } => "COMMON_TIMEOUT",
            CommonError::Io(_) => "COMMON_IO",
            CommonError::Internal { .. } => "COMMON_INTERNAL",
        }
    }
}

impl CommonError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
