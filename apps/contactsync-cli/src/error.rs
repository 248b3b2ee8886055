//! CLI error types and exit codes

use contactsync_engine::SyncError;
use thiserror::Error;

/// Exit codes for the CLI
/// - 0: Run completed
/// - 1: General error
/// - 2: Run aborted (authentication, store outage)
/// - 3: Run partially completed
/// - 4: Invalid input or configuration
/// - 5: Run cancelled
pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid snapshot {path}: {message}")]
    Snapshot { path: String, message: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Sync could not start: {0}")]
    Sync(#[from] SyncError),

    #[error("Sync run failed: {0}")]
    RunFailed(String),

    #[error("Sync run left {unapplied} write(s) unapplied and {conflicts} match conflict(s) unresolved")]
    PartiallyCompleted { unapplied: usize, conflicts: usize },

    #[error("Sync run cancelled")]
    Cancelled,
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) | CliError::Snapshot { .. } => 4,
            CliError::Io(_) => 1,
            CliError::Sync(e) if e.error_code() == "INVALID_CONFIG" => 4,
            CliError::Sync(_) => 1,
            CliError::RunFailed(_) => 2,
            CliError::PartiallyCompleted { .. } => 3,
            CliError::Cancelled => 5,
        }
    }

    /// Print the error to stderr with appropriate formatting
    pub fn print(&self) {
        let use_color = std::env::var("NO_COLOR").is_err();

        if use_color {
            eprintln!("\x1b[31mError:\x1b[0m {}", self);
        } else {
            eprintln!("Error: {}", self);
        }

        if let Some(suggestion) = self.suggestion() {
            if use_color {
                eprintln!("\n\x1b[33mSuggestion:\x1b[0m {}", suggestion);
            } else {
                eprintln!("\nSuggestion: {}", suggestion);
            }
        }
    }

    fn suggestion(&self) -> Option<&'static str> {
        match self {
            CliError::Config(_) => Some("Run 'contactsync check-config' to validate the file."),
            CliError::PartiallyCompleted { conflicts: 0, .. } => {
                Some("Run the sync again; unapplied writes are re-derived from the same changes.")
            }
            CliError::PartiallyCompleted { .. } => Some(
                "Edit or remove one of the conflicting records; the conflict is reported on every run until then.",
            ),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::Io(e.to_string())
    }
}
