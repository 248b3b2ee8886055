//! Sync run bookkeeping: phases, status, counts and reports.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use contactsync_directory::ids::{ContactId, NativeId, UserId, Watermark};
use contactsync_directory::record::WriteTarget;
use contactsync_directory::types::DirectoryKind;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::contact::FieldName;
use crate::error::{SyncError, SyncResult};

/// Phase of the orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Detecting,
    Matching,
    Merging,
    Applying,
    Committing,
    /// Aborted on a non-recoverable error.
    Failed,
}

impl SyncPhase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Detecting => "detecting",
            SyncPhase::Matching => "matching",
            SyncPhase::Merging => "merging",
            SyncPhase::Applying => "applying",
            SyncPhase::Committing => "committing",
            SyncPhase::Failed => "failed",
        }
    }

    /// Check if a transition from this phase to `target` is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match (self, target) {
            (Self::Idle, Self::Detecting)
            | (Self::Detecting, Self::Matching)
            | (Self::Matching, Self::Merging)
            | (Self::Merging, Self::Applying)
            | (Self::Applying, Self::Committing)
            | (Self::Committing, Self::Idle) => true,
            (from, Self::Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SyncPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(SyncPhase::Idle),
            "detecting" => Ok(SyncPhase::Detecting),
            "matching" => Ok(SyncPhase::Matching),
            "merging" => Ok(SyncPhase::Merging),
            "applying" => Ok(SyncPhase::Applying),
            "committing" => Ok(SyncPhase::Committing),
            "failed" => Ok(SyncPhase::Failed),
            _ => Err(format!("Unknown sync phase: {s}")),
        }
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every delta was applied.
    Completed,
    /// Some deltas failed or were re-queued, or a match conflict is still
    /// open; the rest was committed.
    PartiallyCompleted,
    /// Dispatch stopped on request; in-flight writes finished.
    Cancelled,
    /// Aborted without committing.
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::PartiallyCompleted => "partially_completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-run counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Changes detected across both directories.
    pub total: usize,
    /// Groups pairing a record from each directory.
    pub matched: usize,
    pub created: usize,
    pub updated: usize,
    pub soft_deleted: usize,
    pub unchanged: usize,
    pub conflicted: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Records held back from auto-merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub records: Vec<(DirectoryKind, NativeId)>,
    pub signal: String,
    pub reason: String,
}

/// A write that did not land in this run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub contact_id: ContactId,
    pub directory: DirectoryKind,
    pub target: WriteTarget,
    pub fields: Vec<FieldName>,
    pub error_code: String,
    pub message: String,
    /// Re-resolved by the next run (stale write).
    pub requeued: bool,
}

/// A detected record the run could not use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub directory: DirectoryKind,
    pub native_id: NativeId,
    pub reason: String,
}

/// Lifecycle record of one `RunSync` invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phase: SyncPhase,
    pub status: RunStatus,
    pub error: Option<String>,
    pub counts: RunCounts,
    pub conflicts: Vec<ConflictReport>,
    pub failures: Vec<FailureReport>,
    pub skipped: Vec<SkippedRecord>,
    /// Watermarks committed at the end of the run, per directory.
    pub committed_watermarks: Vec<(DirectoryKind, Watermark)>,
}

impl SyncRun {
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            started_at: Utc::now(),
            finished_at: None,
            phase: SyncPhase::Idle,
            status: RunStatus::Completed,
            error: None,
            counts: RunCounts::default(),
            conflicts: Vec::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
            committed_watermarks: Vec::new(),
        }
    }

    /// Move to `target`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, target: SyncPhase) -> SyncResult<()> {
        if !self.phase.can_transition_to(target) {
            return Err(SyncError::invalid_state_transition(
                self.phase.as_str(),
                target.as_str(),
            ));
        }
        debug!(run_id = %self.id, from = %self.phase, to = %target, "Sync phase transition");
        self.phase = target;
        Ok(())
    }

    /// Abort the run.
    pub fn fail(&mut self, error: &SyncError) {
        self.phase = SyncPhase::Failed;
        self.status = RunStatus::Failed;
        self.error = Some(error.to_string());
        self.finished_at = Some(Utc::now());
    }

    /// Close the run with `status`.
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn skip(&mut self, directory: DirectoryKind, native_id: NativeId, reason: impl Into<String>) {
        self.counts.skipped += 1;
        self.skipped.push(SkippedRecord {
            directory,
            native_id,
            reason: reason.into(),
        });
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }

    /// Watermark committed for `directory` by this run, if any.
    #[must_use]
    pub fn committed(&self, directory: DirectoryKind) -> Option<&Watermark> {
        self.committed_watermarks
            .iter()
            .find(|(kind, _)| *kind == directory)
            .map(|(_, w)| w)
    }

    /// Pretty-printed JSON report of the run.
    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Cooperative cancellation shared between a caller and a running sync.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    cancelled: Arc<AtomicBool>,
}

impl CancelSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
