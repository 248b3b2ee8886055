//! In-memory directory.
//!
//! Keeps records and an append-only change log behind a mutex. Watermarks are
//! log sequence numbers. Used by the engine's tests and by the CLI when it
//! syncs two JSON snapshots. Fault injection hooks let tests simulate stale
//! writes, transient outages and revoked credentials.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{DirectoryError, DirectoryResult};
use crate::ids::{NativeId, Revision, Watermark};
use crate::payload::NativePayload;
use crate::record::{ChangeEntry, ChangePage, DirectoryRecord, WriteReceipt, WriteTarget};
use crate::traits::DirectoryClient;
use crate::types::{ChangeKind, DirectoryKind};

#[derive(Debug, Clone)]
struct StoredRecord {
    /// `None` once hard-deleted.
    payload: Option<NativePayload>,
    revision: u64,
    updated_at: DateTime<Utc>,
    created_seq: u64,
    last_seq: u64,
}

impl StoredRecord {
    fn snapshot(&self, kind: DirectoryKind, native_id: &NativeId) -> DirectoryRecord {
        match &self.payload {
            Some(payload) => DirectoryRecord::new(
                native_id.clone(),
                Revision::new(self.revision.to_string()),
                payload.clone(),
                self.updated_at,
            ),
            None => DirectoryRecord::tombstone(kind, native_id.clone(), self.updated_at),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<NativeId, StoredRecord>,
    head_seq: u64,
    compacted_before: u64,
    next_id: u64,
    auth_revoked: bool,
    transient_write_failures: u32,
    write_faults: HashMap<NativeId, DirectoryError>,
    writes: Vec<(WriteTarget, NativePayload)>,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.head_seq += 1;
        self.head_seq
    }
}

/// A directory held entirely in memory.
#[derive(Debug)]
pub struct InMemoryDirectory {
    kind: DirectoryKind,
    state: Mutex<State>,
}

impl InMemoryDirectory {
    #[must_use]
    pub fn new(kind: DirectoryKind) -> Self {
        Self {
            kind,
            state: Mutex::new(State::default()),
        }
    }

    /// Create a directory pre-populated with `records` as external inserts.
    pub async fn with_records(
        kind: DirectoryKind,
        records: impl IntoIterator<Item = (NativeId, NativePayload)>,
    ) -> DirectoryResult<Self> {
        let directory = Self::new(kind);
        for (native_id, payload) in records {
            directory.upsert(native_id, payload).await?;
        }
        Ok(directory)
    }

    fn allocate_id(&self, state: &mut State) -> NativeId {
        state.next_id += 1;
        match self.kind {
            DirectoryKind::Messaging => NativeId::new(format!("m{}", state.next_id)),
            DirectoryKind::Cloud => NativeId::new(format!("people/c{}", state.next_id)),
        }
    }

    fn check_payload(&self, payload: &NativePayload) -> DirectoryResult<()> {
        if payload.kind() == self.kind {
            Ok(())
        } else {
            Err(DirectoryError::invalid_data(format!(
                "{} payload sent to {} directory",
                payload.kind(),
                self.kind
            )))
        }
    }

    /// Insert or replace a record as if a user edited it in the directory.
    pub async fn upsert(
        &self,
        native_id: impl Into<NativeId>,
        payload: NativePayload,
    ) -> DirectoryResult<Revision> {
        self.upsert_at(native_id, payload, Utc::now()).await
    }

    /// Like [`upsert`](Self::upsert) with an explicit modification time.
    pub async fn upsert_at(
        &self,
        native_id: impl Into<NativeId>,
        payload: NativePayload,
        updated_at: DateTime<Utc>,
    ) -> DirectoryResult<Revision> {
        self.check_payload(&payload)?;
        let native_id = native_id.into();
        let mut state = self.state.lock().await;
        let seq = state.next_seq();
        let record = state
            .records
            .entry(native_id)
            .or_insert_with(|| StoredRecord {
                payload: None,
                revision: 0,
                updated_at,
                created_seq: seq,
                last_seq: seq,
            });
        if record.payload.is_none() {
            record.created_seq = seq;
        }
        record.payload = Some(payload);
        record.revision += 1;
        record.updated_at = updated_at;
        record.last_seq = seq;
        Ok(Revision::new(record.revision.to_string()))
    }

    /// Hard-delete a record; the change stream reports a tombstone.
    pub async fn delete(&self, native_id: &NativeId) -> DirectoryResult<()> {
        let mut state = self.state.lock().await;
        let seq = state.next_seq();
        let record = state
            .records
            .get_mut(native_id)
            .ok_or_else(|| DirectoryError::NotFound {
                native_id: native_id.clone(),
            })?;
        record.payload = None;
        record.revision += 1;
        record.updated_at = Utc::now();
        record.last_seq = seq;
        Ok(())
    }

    /// Current payload of a record, if it exists.
    pub async fn get(&self, native_id: &NativeId) -> Option<NativePayload> {
        let state = self.state.lock().await;
        state.records.get(native_id).and_then(|r| r.payload.clone())
    }

    /// All live records, ordered by native ID.
    pub async fn snapshot(&self) -> Vec<DirectoryRecord> {
        let state = self.state.lock().await;
        state
            .records
            .iter()
            .filter(|(_, r)| r.payload.is_some())
            .map(|(id, r)| r.snapshot(self.kind, id))
            .collect()
    }

    /// Number of successful writes made through [`DirectoryClient::write_record`].
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes.len()
    }

    /// Writes made through [`DirectoryClient::write_record`], in order.
    pub async fn writes(&self) -> Vec<(WriteTarget, NativePayload)> {
        self.state.lock().await.writes.clone()
    }

    /// Current change log head as a watermark.
    pub async fn head(&self) -> Watermark {
        Watermark::new(self.state.lock().await.head_seq.to_string())
    }

    /// Forget change history up to the current head; older watermarks become
    /// invalid.
    pub async fn compact(&self) {
        let mut state = self.state.lock().await;
        state.compacted_before = state.head_seq;
    }

    /// Every call fails with `AuthenticationFailed` until restored.
    pub async fn revoke_auth(&self) {
        self.state.lock().await.auth_revoked = true;
    }

    pub async fn restore_auth(&self) {
        self.state.lock().await.auth_revoked = false;
    }

    /// The next `count` writes fail with a transient `Unavailable` error.
    pub async fn fail_next_writes(&self, count: u32) {
        self.state.lock().await.transient_write_failures = count;
    }

    /// Writes to `native_id` fail with `error` until cleared.
    pub async fn fail_writes_to(&self, native_id: NativeId, error: DirectoryError) {
        self.state.lock().await.write_faults.insert(native_id, error);
    }

    pub async fn clear_write_faults(&self) {
        self.state.lock().await.write_faults.clear();
    }

    fn ensure_authorized(&self, state: &State) -> DirectoryResult<()> {
        if state.auth_revoked {
            Err(DirectoryError::AuthenticationFailed {
                directory: self.kind,
            })
        } else {
            Ok(())
        }
    }

    fn parse_watermark(&self, state: &State, since: Option<&Watermark>) -> DirectoryResult<u64> {
        let Some(since) = since else {
            return Ok(0);
        };
        let invalid = || DirectoryError::InvalidWatermark {
            watermark: since.to_string(),
        };
        let seq: u64 = since.as_str().parse().map_err(|_| invalid())?;
        if seq > state.head_seq || seq < state.compacted_before {
            return Err(invalid());
        }
        Ok(seq)
    }
}

#[async_trait]
impl DirectoryClient for InMemoryDirectory {
    fn kind(&self) -> DirectoryKind {
        self.kind
    }

    async fn list_changes(
        &self,
        since: Option<&Watermark>,
        limit: usize,
    ) -> DirectoryResult<ChangePage> {
        let state = self.state.lock().await;
        self.ensure_authorized(&state)?;
        let from = self.parse_watermark(&state, since)?;
        let initial = since.is_none();

        let mut pending: Vec<(u64, &NativeId, &StoredRecord)> = state
            .records
            .iter()
            .filter(|(_, r)| r.last_seq > from)
            .filter(|(_, r)| !(initial && r.payload.is_none()))
            .map(|(id, r)| (r.last_seq, id, r))
            .collect();
        pending.sort_by_key(|(seq, _, _)| *seq);

        let limit = limit.max(1);
        let has_more = pending.len() > limit;
        let entries: Vec<ChangeEntry> = pending
            .into_iter()
            .take(limit)
            .map(|(seq, id, r)| {
                let kind = if r.payload.is_none() {
                    ChangeKind::Deleted
                } else if initial || r.created_seq > from {
                    ChangeKind::Created
                } else {
                    ChangeKind::Updated
                };
                ChangeEntry {
                    kind,
                    record: r.snapshot(self.kind, id),
                    position: Watermark::new(seq.to_string()),
                }
            })
            .collect();

        let next_watermark = if has_more {
            entries
                .last()
                .map_or_else(|| Watermark::new(from.to_string()), |e| e.position.clone())
        } else {
            Watermark::new(state.head_seq.to_string())
        };

        Ok(ChangePage {
            entries,
            next_watermark,
            has_more,
        })
    }

    async fn fetch_record(&self, native_id: &NativeId) -> DirectoryResult<Option<DirectoryRecord>> {
        let state = self.state.lock().await;
        self.ensure_authorized(&state)?;
        Ok(state
            .records
            .get(native_id)
            .filter(|r| r.payload.is_some())
            .map(|r| r.snapshot(self.kind, native_id)))
    }

    async fn write_record(
        &self,
        target: &WriteTarget,
        payload: NativePayload,
        expected_revision: Option<&Revision>,
    ) -> DirectoryResult<WriteReceipt> {
        self.check_payload(&payload)?;
        let mut state = self.state.lock().await;
        self.ensure_authorized(&state)?;

        if state.transient_write_failures > 0 {
            state.transient_write_failures -= 1;
            return Err(DirectoryError::unavailable("injected outage"));
        }
        if let Some(id) = target.native_id() {
            if let Some(error) = state.write_faults.get(id) {
                return Err(error.clone());
            }
        }

        let seq = state.next_seq();
        let now = Utc::now();
        let native_id = match target {
            WriteTarget::Create => {
                let native_id = self.allocate_id(&mut state);
                state.records.insert(
                    native_id.clone(),
                    StoredRecord {
                        payload: Some(payload.clone()),
                        revision: 1,
                        updated_at: now,
                        created_seq: seq,
                        last_seq: seq,
                    },
                );
                native_id
            }
            WriteTarget::Existing(native_id) => {
                let record = state
                    .records
                    .get_mut(native_id)
                    .filter(|r| r.payload.is_some())
                    .ok_or_else(|| DirectoryError::NotFound {
                        native_id: native_id.clone(),
                    })?;
                let current = Revision::new(record.revision.to_string());
                if let Some(expected) = expected_revision {
                    if *expected != current {
                        return Err(DirectoryError::stale_write(
                            native_id.clone(),
                            Some(expected.clone()),
                            Some(current),
                        ));
                    }
                }
                record.payload = Some(payload.clone());
                record.revision += 1;
                record.updated_at = now;
                record.last_seq = seq;
                native_id.clone()
            }
        };

        let revision = state
            .records
            .get(&native_id)
            .map(|r| Revision::new(r.revision.to_string()))
            .ok_or_else(|| DirectoryError::internal("record vanished during write"))?;
        state.writes.push((target.clone(), payload));

        Ok(WriteReceipt {
            native_id,
            revision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::MessagingContact;

    fn contact(name: &str) -> NativePayload {
        NativePayload::Messaging(MessagingContact {
            first_name: Some(name.to_string()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_initial_listing_returns_live_records() {
        let dir = InMemoryDirectory::new(DirectoryKind::Messaging);
        dir.upsert("a", contact("Ann")).await.unwrap();
        dir.upsert("b", contact("Bob")).await.unwrap();
        dir.delete(&NativeId::new("b")).await.unwrap();

        let page = dir.list_changes(None, 10).await.unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].kind, ChangeKind::Created);
        assert!(!page.has_more);
        assert_eq!(page.next_watermark, Watermark::new("3"));
    }

    #[tokio::test]
    async fn test_incremental_listing_and_tombstones() {
        let dir = InMemoryDirectory::new(DirectoryKind::Messaging);
        dir.upsert("a", contact("Ann")).await.unwrap();
        let mark = dir.head().await;
        dir.upsert("a", contact("Anne")).await.unwrap();
        dir.upsert("b", contact("Bob")).await.unwrap();
        dir.delete(&NativeId::new("b")).await.unwrap();

        let page = dir.list_changes(Some(&mark), 10).await.unwrap();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].kind, ChangeKind::Updated);
        assert_eq!(page.entries[1].kind, ChangeKind::Deleted);
        assert!(page.entries[1].record.is_tombstone());
    }

    #[tokio::test]
    async fn test_paging_positions_are_monotonic() {
        let dir = InMemoryDirectory::new(DirectoryKind::Messaging);
        for name in ["a", "b", "c"] {
            dir.upsert(name, contact(name)).await.unwrap();
        }
        let first = dir.list_changes(None, 2).await.unwrap();
        assert!(first.has_more);
        assert_eq!(first.next_watermark, Watermark::new("2"));
        let second = dir
            .list_changes(Some(&first.next_watermark), 2)
            .await
            .unwrap();
        assert_eq!(second.entries.len(), 1);
        assert_eq!(second.entries[0].position, Watermark::new("3"));
        assert!(!second.has_more);
    }

    #[tokio::test]
    async fn test_relisting_is_superset() {
        let dir = InMemoryDirectory::new(DirectoryKind::Messaging);
        dir.upsert("a", contact("Ann")).await.unwrap();
        let first = dir.list_changes(None, 10).await.unwrap();
        dir.upsert("b", contact("Bob")).await.unwrap();
        let second = dir.list_changes(None, 10).await.unwrap();
        for entry in &first.entries {
            assert!(second
                .entries
                .iter()
                .any(|e| e.record.native_id == entry.record.native_id));
        }
    }

    #[tokio::test]
    async fn test_stale_write_rejected() {
        let dir = InMemoryDirectory::new(DirectoryKind::Messaging);
        let rev = dir.upsert("a", contact("Ann")).await.unwrap();
        dir.upsert("a", contact("Annie")).await.unwrap();

        let err = dir
            .write_record(
                &WriteTarget::Existing(NativeId::new("a")),
                contact("Anna"),
                Some(&rev),
            )
            .await
            .unwrap_err();
        assert!(err.is_stale_write());
        assert_eq!(dir.get(&NativeId::new("a")).await, Some(contact("Annie")));
    }

    #[tokio::test]
    async fn test_create_allocates_id() {
        let dir = InMemoryDirectory::new(DirectoryKind::Cloud);
        let receipt = dir
            .write_record(
                &WriteTarget::Create,
                NativePayload::empty(DirectoryKind::Cloud),
                None,
            )
            .await
            .unwrap();
        assert!(receipt.native_id.as_str().starts_with("people/c"));
        assert_eq!(receipt.revision, Revision::new("1"));
        assert_eq!(dir.write_count().await, 1);
    }

    #[tokio::test]
    async fn test_wrong_payload_kind_rejected() {
        let dir = InMemoryDirectory::new(DirectoryKind::Cloud);
        let err = dir.upsert("a", contact("Ann")).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_DATA");
    }

    #[tokio::test]
    async fn test_compacted_watermark_invalid() {
        let dir = InMemoryDirectory::new(DirectoryKind::Messaging);
        dir.upsert("a", contact("Ann")).await.unwrap();
        let old = Watermark::new("0");
        dir.upsert("b", contact("Bob")).await.unwrap();
        dir.compact().await;
        let err = dir.list_changes(Some(&old), 10).await.unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidWatermark { .. }));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let dir = InMemoryDirectory::new(DirectoryKind::Messaging);
        dir.upsert("a", contact("Ann")).await.unwrap();
        dir.fail_next_writes(1).await;
        let target = WriteTarget::Existing(NativeId::new("a"));
        let err = dir
            .write_record(&target, contact("Anna"), None)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(dir.write_record(&target, contact("Anna"), None).await.is_ok());

        dir.revoke_auth().await;
        let err = dir.list_changes(None, 10).await.unwrap_err();
        assert!(err.is_auth_failure());
    }
}
