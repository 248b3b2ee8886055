//! Sync engine error types.

use contactsync_directory::ids::UserId;
use contactsync_directory::DirectoryError;
use thiserror::Error;

/// A native record could not be mapped to canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Schema error in field '{field}': {message}")]
pub struct SchemaError {
    /// Native field that failed to map.
    pub field: String,
    pub message: String,
}

impl SchemaError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors raised by the storage interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store cannot be reached. Aborts a run.
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    /// A run is already in flight for this user.
    #[error("A sync run is already in progress for user {user_id}")]
    AlreadyRunning { user_id: UserId },

    /// The lease was not held (expired or released twice).
    #[error("Lease {lease_id} is not held")]
    LeaseNotHeld { lease_id: String },

    /// Stored data is inconsistent.
    #[error("Store corrupted: {message}")]
    Corrupted { message: String },
}

impl StoreError {
    /// Create an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create a corrupted error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during synchronization.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed native record.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Directory error.
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Storage error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Invalid state transition.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// An engine invariant does not hold.
    #[error("Invariant violated: {message}")]
    Invariant { message: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parse error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Create a schema error.
    pub fn schema(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema(SchemaError::new(field, message))
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid state transition error.
    pub fn invalid_state_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidStateTransition {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create an invariant error.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    /// Errors that abort the whole run rather than one contact.
    ///
    /// Authentication failures and watermark store unavailability are fatal.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Directory(e) => e.is_auth_failure(),
            SyncError::Store(StoreError::Unavailable { .. } | StoreError::Corrupted { .. }) => true,
            SyncError::Schema(_) => false,
            _ => true,
        }
    }

    /// Check if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Directory(e) => e.is_transient(),
            SyncError::Io(_) => true,
            _ => false,
        }
    }

    /// Get an error code for classification.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::Schema(_) => "SCHEMA_ERROR",
            SyncError::Directory(e) => e.error_code(),
            SyncError::Store(StoreError::AlreadyRunning { .. }) => "ALREADY_RUNNING",
            SyncError::Store(_) => "STORE_ERROR",
            SyncError::Configuration { .. } => "INVALID_CONFIG",
            SyncError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            SyncError::Invariant { .. } => "INVARIANT_VIOLATED",
            SyncError::Serialization(_) => "SERIALIZATION_ERROR",
            SyncError::Yaml(_) => "YAML_ERROR",
            SyncError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
