//! Change detection over a directory's change stream.
//!
//! Pages through `list_changes` from a watermark. Nothing is committed here:
//! the orchestrator decides how far the stream was consumed once the run's
//! writes are known, using [`ChangeSet::committable_watermark`]. Until then a
//! repeated detection from the same watermark re-delivers every change.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use contactsync_directory::error::DirectoryError;
use contactsync_directory::ids::{NativeId, Watermark};
use contactsync_directory::record::{ChangeEntry, DirectoryRecord};
use contactsync_directory::resilience::{with_timeout, RetryPolicy};
use contactsync_directory::traits::DirectoryClient;
use contactsync_directory::types::{ChangeKind, DirectoryKind};
use tracing::{debug, instrument, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

/// Changes observed in one directory since a watermark.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub directory: DirectoryKind,
    /// Watermark detection started from.
    pub since: Option<Watermark>,
    /// Entries in stream order.
    pub entries: Vec<ChangeEntry>,
    /// Watermark covering the whole set.
    pub new_watermark: Option<Watermark>,
    /// The stored watermark was rejected and the directory was listed in full.
    pub full_resync: bool,
}

impl ChangeSet {
    fn of_kind(&self, kind: ChangeKind) -> impl Iterator<Item = &DirectoryRecord> {
        self.entries
            .iter()
            .filter(move |e| e.kind == kind)
            .map(|e| &e.record)
    }

    pub fn created(&self) -> impl Iterator<Item = &DirectoryRecord> {
        self.of_kind(ChangeKind::Created)
    }

    pub fn updated(&self) -> impl Iterator<Item = &DirectoryRecord> {
        self.of_kind(ChangeKind::Updated)
    }

    pub fn deleted(&self) -> impl Iterator<Item = &DirectoryRecord> {
        self.of_kind(ChangeKind::Deleted)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Latest observation of every changed record, in stream order of that
    /// observation.
    #[must_use]
    pub fn latest_records(&self) -> Vec<DirectoryRecord> {
        let last_index: HashMap<&NativeId, usize> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (&e.record.native_id, i))
            .collect();
        self.entries
            .iter()
            .enumerate()
            .filter(|(i, e)| last_index.get(&e.record.native_id) == Some(i))
            .map(|(_, e)| e.record.clone())
            .collect()
    }

    /// Furthest watermark that can be committed when the records in
    /// `blocked` still need another run.
    ///
    /// This is the position of the last entry before the first blocked one,
    /// or the full-set watermark when nothing is blocked. `None` means the
    /// stored watermark must stay as it is.
    #[must_use]
    pub fn committable_watermark(&self, blocked: &HashSet<NativeId>) -> Option<Watermark> {
        let mut committable = self.since.clone();
        for entry in &self.entries {
            if blocked.contains(&entry.record.native_id) {
                return committable.filter(|w| Some(w) != self.since.as_ref());
            }
            committable = Some(entry.position.clone());
        }
        self.new_watermark
            .clone()
            .or(committable)
            .filter(|w| Some(w) != self.since.as_ref())
    }
}

/// Reads change pages from a directory.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    page_size: usize,
    request_timeout: Duration,
    retry: RetryPolicy,
}

impl ChangeDetector {
    #[must_use]
    pub fn new(page_size: usize, request_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            page_size: page_size.max(1),
            request_timeout,
            retry,
        }
    }

    /// Detector for `kind` configured from `config`.
    #[must_use]
    pub fn from_config(config: &SyncConfig, kind: DirectoryKind) -> Self {
        Self::new(
            config.directory(kind).page_size,
            config.request_timeout(),
            config.retry_policy(),
        )
    }

    /// Collect every change after `since`.
    ///
    /// An expired or unknown watermark falls back to a full listing.
    #[instrument(skip(self, client), fields(directory = %client.kind()))]
    pub async fn detect_changes(
        &self,
        client: &dyn DirectoryClient,
        since: Option<&Watermark>,
    ) -> SyncResult<ChangeSet> {
        match self.collect(client, since).await {
            Err(SyncError::Directory(DirectoryError::InvalidWatermark { watermark }))
                if since.is_some() =>
            {
                warn!(
                    directory = %client.kind(),
                    watermark = %watermark,
                    "Watermark rejected, falling back to full listing"
                );
                let mut changes = self.collect(client, None).await?;
                changes.since = since.cloned();
                changes.full_resync = true;
                Ok(changes)
            }
            other => other,
        }
    }

    async fn collect(
        &self,
        client: &dyn DirectoryClient,
        since: Option<&Watermark>,
    ) -> SyncResult<ChangeSet> {
        let mut entries = Vec::new();
        let mut cursor = since.cloned();
        let mut pages = 0u32;

        loop {
            let page = self
                .retry
                .execute(|| {
                    with_timeout(
                        self.request_timeout,
                        client.list_changes(cursor.as_ref(), self.page_size),
                    )
                })
                .await?;
            pages += 1;

            let advanced = cursor.as_ref() != Some(&page.next_watermark);
            entries.extend(page.entries);
            cursor = Some(page.next_watermark);
            if !page.has_more {
                break;
            }
            if !advanced {
                return Err(SyncError::invariant(format!(
                    "{} change stream did not advance past {:?}",
                    client.kind(),
                    cursor
                )));
            }
        }

        debug!(
            directory = %client.kind(),
            pages,
            changes = entries.len(),
            "Change detection finished"
        );

        Ok(ChangeSet {
            directory: client.kind(),
            since: since.cloned(),
            entries,
            new_watermark: cursor,
            full_resync: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contactsync_directory::memory::InMemoryDirectory;
    use contactsync_directory::payload::{MessagingContact, NativePayload};
    use contactsync_directory::resilience::no_jitter;

    fn contact(first: &str) -> NativePayload {
        NativePayload::Messaging(MessagingContact {
            first_name: Some(first.into()),
            ..Default::default()
        })
    }

    fn detector(page_size: usize) -> ChangeDetector {
        ChangeDetector::new(
            page_size,
            Duration::from_secs(5),
            RetryPolicy::new(2, Duration::from_millis(1)).with_jitter(no_jitter()),
        )
    }

    async fn directory_with(names: &[&str]) -> InMemoryDirectory {
        let directory = InMemoryDirectory::new(DirectoryKind::Messaging);
        for (i, name) in names.iter().enumerate() {
            directory
                .upsert(format!("m{i}"), contact(name))
                .await
                .unwrap();
        }
        directory
    }

    #[tokio::test]
    async fn test_pages_through_all_changes() {
        let directory = directory_with(&["a", "b", "c", "d", "e"]).await;
        let changes = detector(2).detect_changes(&directory, None).await.unwrap();
        assert_eq!(changes.len(), 5);
        assert_eq!(changes.created().count(), 5);
        assert_eq!(changes.new_watermark, Some(directory.head().await));
        assert!(!changes.full_resync);
    }

    #[tokio::test]
    async fn test_repeat_detection_is_superset() {
        let directory = directory_with(&["a", "b"]).await;
        let first = detector(10).detect_changes(&directory, None).await.unwrap();
        let watermark = first.new_watermark.clone().unwrap();

        directory.upsert("m0", contact("a2")).await.unwrap();
        directory.upsert("m9", contact("z")).await.unwrap();

        let second = detector(10)
            .detect_changes(&directory, Some(&watermark))
            .await
            .unwrap();
        // Not committed: the same call yields the same set again.
        let again = detector(10)
            .detect_changes(&directory, Some(&watermark))
            .await
            .unwrap();
        let ids = |c: &ChangeSet| {
            c.latest_records()
                .into_iter()
                .map(|r| r.native_id)
                .collect::<HashSet<_>>()
        };
        assert_eq!(ids(&second).len(), 2);
        assert!(ids(&again).is_superset(&ids(&second)));
        assert_eq!(second.updated().count(), 1);
        assert_eq!(second.created().count(), 1);
    }

    #[tokio::test]
    async fn test_deletion_reported_as_tombstone() {
        let directory = directory_with(&["a"]).await;
        let watermark = directory.head().await;
        directory.delete(&NativeId::new("m0")).await.unwrap();

        let changes = detector(10)
            .detect_changes(&directory, Some(&watermark))
            .await
            .unwrap();
        let deleted: Vec<_> = changes.deleted().collect();
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].is_tombstone());
    }

    #[tokio::test]
    async fn test_invalid_watermark_falls_back_to_full_listing() {
        let directory = directory_with(&["a", "b"]).await;
        let stale = Watermark::new("1");
        directory.compact().await;

        let changes = detector(10)
            .detect_changes(&directory, Some(&stale))
            .await
            .unwrap();
        assert!(changes.full_resync);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes.since, Some(stale));
    }

    #[tokio::test]
    async fn test_auth_failure_propagates() {
        let directory = directory_with(&["a"]).await;
        directory.revoke_auth().await;
        let err = detector(10).detect_changes(&directory, None).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_committable_watermark_stops_before_blocked_record() {
        let directory = directory_with(&["a", "b", "c"]).await;
        let changes = detector(10).detect_changes(&directory, None).await.unwrap();

        assert_eq!(
            changes.committable_watermark(&HashSet::new()),
            changes.new_watermark
        );

        let blocked: HashSet<NativeId> = [NativeId::new("m1")].into_iter().collect();
        assert_eq!(
            changes.committable_watermark(&blocked),
            Some(changes.entries[0].position.clone())
        );

        let first_blocked: HashSet<NativeId> = [NativeId::new("m0")].into_iter().collect();
        assert_eq!(changes.committable_watermark(&first_blocked), None);
    }

    #[tokio::test]
    async fn test_empty_stream_keeps_watermark() {
        let directory = directory_with(&["a"]).await;
        let head = directory.head().await;
        let changes = detector(10)
            .detect_changes(&directory, Some(&head))
            .await
            .unwrap();
        assert!(changes.is_empty());
        assert_eq!(changes.committable_watermark(&HashSet::new()), None);
    }
}
