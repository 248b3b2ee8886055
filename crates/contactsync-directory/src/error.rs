//! Directory error types
//!
//! Error definitions with transient/permanent classification for retry logic.

use thiserror::Error;

use crate::ids::{NativeId, Revision};
use crate::types::DirectoryKind;

/// Error returned by a directory client.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DirectoryError {
    // Transient errors
    /// The directory throttled the request.
    #[error("rate limited by directory (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    /// The request did not complete in time.
    #[error("request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// The directory is temporarily unavailable.
    #[error("directory unavailable: {message}")]
    Unavailable { message: String },

    /// Network error during communication.
    #[error("network error: {message}")]
    Network { message: String },

    // Authentication errors (abort the run)
    /// Credentials were rejected or revoked.
    #[error("authentication failed for {directory} directory")]
    AuthenticationFailed { directory: DirectoryKind },

    /// Credentials lack permission for the operation.
    #[error("authorization failed for {directory} directory: {operation}")]
    AuthorizationFailed {
        directory: DirectoryKind,
        operation: String,
    },

    // Record-scoped errors
    /// The record changed since it was last read.
    #[error("stale write to {native_id}: expected revision {expected:?}, found {actual:?}")]
    StaleWrite {
        native_id: NativeId,
        expected: Option<Revision>,
        actual: Option<Revision>,
    },

    /// The addressed record does not exist.
    #[error("record not found: {native_id}")]
    NotFound { native_id: NativeId },

    /// The payload was rejected by the directory.
    #[error("invalid data: {message}")]
    InvalidData { message: String },

    // Change stream errors
    /// The watermark is unknown or expired; a full listing is required.
    #[error("invalid or expired watermark: {watermark}")]
    InvalidWatermark { watermark: String },

    // Retry errors
    /// A transient error persisted past the retry budget.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<DirectoryError>,
    },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl DirectoryError {
    /// Check if this error is transient and the operation should be retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DirectoryError::RateLimited { .. }
                | DirectoryError::Timeout { .. }
                | DirectoryError::Unavailable { .. }
                | DirectoryError::Network { .. }
        )
    }

    /// Check if this error is permanent and retry won't help.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Authentication and authorization failures abort the whole run.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            DirectoryError::AuthenticationFailed { .. } | DirectoryError::AuthorizationFailed { .. }
        )
    }

    /// Check if this error is a lost optimistic-concurrency race.
    #[must_use]
    pub fn is_stale_write(&self) -> bool {
        matches!(self, DirectoryError::StaleWrite { .. })
    }

    /// Get an error code for classification.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            DirectoryError::RateLimited { .. } => "RATE_LIMITED",
            DirectoryError::Timeout { .. } => "TIMEOUT",
            DirectoryError::Unavailable { .. } => "UNAVAILABLE",
            DirectoryError::Network { .. } => "NETWORK_ERROR",
            DirectoryError::AuthenticationFailed { .. } => "AUTH_FAILED",
            DirectoryError::AuthorizationFailed { .. } => "AUTHORIZATION_FAILED",
            DirectoryError::StaleWrite { .. } => "STALE_WRITE",
            DirectoryError::NotFound { .. } => "NOT_FOUND",
            DirectoryError::InvalidData { .. } => "INVALID_DATA",
            DirectoryError::InvalidWatermark { .. } => "INVALID_WATERMARK",
            DirectoryError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            DirectoryError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    // Convenience constructors

    /// Create an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        DirectoryError::Unavailable {
            message: message.into(),
        }
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        DirectoryError::Network {
            message: message.into(),
        }
    }

    /// Create an invalid data error.
    pub fn invalid_data(message: impl Into<String>) -> Self {
        DirectoryError::InvalidData {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        DirectoryError::Internal {
            message: message.into(),
        }
    }

    /// Create a stale write error.
    pub fn stale_write(
        native_id: NativeId,
        expected: Option<Revision>,
        actual: Option<Revision>,
    ) -> Self {
        DirectoryError::StaleWrite {
            native_id,
            expected,
            actual,
        }
    }
}

/// Result type for directory operations.
pub type DirectoryResult<T> = Result<T, DirectoryError>;
