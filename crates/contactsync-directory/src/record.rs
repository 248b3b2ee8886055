//! Directory records and change stream pages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{NativeId, Revision, Watermark};
use crate::payload::NativePayload;
use crate::types::{ChangeKind, DirectoryKind};

/// Snapshot of one contact as seen in one directory.
///
/// Records are owned by the directory's change stream. The engine reads and
/// supersedes them but never mutates one in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub directory: DirectoryKind,
    pub native_id: NativeId,
    /// Version token; absent on tombstones.
    pub revision: Option<Revision>,
    /// Raw field values; absent on tombstones.
    pub payload: Option<NativePayload>,
    /// When the engine observed this snapshot.
    pub observed_at: DateTime<Utc>,
    /// When the directory last modified the record.
    pub updated_at: DateTime<Utc>,
}

impl DirectoryRecord {
    /// Create a live record snapshot.
    pub fn new(
        native_id: impl Into<NativeId>,
        revision: Revision,
        payload: NativePayload,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            directory: payload.kind(),
            native_id: native_id.into(),
            revision: Some(revision),
            payload: Some(payload),
            observed_at: Utc::now(),
            updated_at,
        }
    }

    /// Create a tombstone carrying only the native ID.
    pub fn tombstone(
        directory: DirectoryKind,
        native_id: impl Into<NativeId>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            directory,
            native_id: native_id.into(),
            revision: None,
            payload: None,
            observed_at: Utc::now(),
            updated_at,
        }
    }

    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }

    /// Tombstone or archived in the directory.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.payload.as_ref().map_or(true, NativePayload::is_archived)
    }
}

/// One entry of a change stream together with its stream position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub kind: ChangeKind,
    pub record: DirectoryRecord,
    /// Watermark that resumes the stream right after this entry.
    pub position: Watermark,
}

/// A page of changes returned by `DirectoryClient::list_changes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePage {
    pub entries: Vec<ChangeEntry>,
    /// Watermark that resumes after the last entry of this page.
    pub next_watermark: Watermark,
    pub has_more: bool,
}

/// Where a write lands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteTarget {
    Existing(NativeId),
    Create,
}

impl WriteTarget {
    #[must_use]
    pub fn native_id(&self) -> Option<&NativeId> {
        match self {
            WriteTarget::Existing(id) => Some(id),
            WriteTarget::Create => None,
        }
    }
}

impl std::fmt::Display for WriteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteTarget::Existing(id) => write!(f, "{id}"),
            WriteTarget::Create => f.write_str("create"),
        }
    }
}

/// Result of a successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReceipt {
    pub native_id: NativeId,
    pub revision: Revision,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::MessagingContact;

    #[test]
    fn test_tombstone_has_no_payload() {
        let record = DirectoryRecord::tombstone(DirectoryKind::Cloud, "people/c1", Utc::now());
        assert!(record.is_tombstone());
        assert!(record.is_deleted());
        assert!(record.revision.is_none());
    }

    #[test]
    fn test_archived_record_is_deleted() {
        let payload = NativePayload::Messaging(MessagingContact {
            archived: true,
            ..Default::default()
        });
        let record = DirectoryRecord::new("42", Revision::new("1"), payload, Utc::now());
        assert!(!record.is_tombstone());
        assert!(record.is_deleted());
        assert_eq!(record.directory, DirectoryKind::Messaging);
    }
}
