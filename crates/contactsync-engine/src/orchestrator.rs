//! Sync orchestration.
//!
//! `RunSync` drives one run through
//! `Idle -> Detecting -> Matching -> Merging -> Applying -> Committing -> Idle`.
//! Failures scoped to one contact are recorded in the run and never stop it.
//! Authentication failures and an unreachable store move the run to `Failed`
//! without committing any watermark.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use contactsync_directory::error::DirectoryResult;
use contactsync_directory::ids::{ContactId, NativeId, UserId};
use contactsync_directory::record::DirectoryRecord;
use contactsync_directory::resilience::{with_timeout, RetryPolicy};
use contactsync_directory::traits::DirectoryClient;
use contactsync_directory::types::DirectoryKind;
use tracing::{debug, error, info, instrument, warn};

use crate::batch::{BasePayloads, BatchResult, BatchScheduler, FailedWrite};
use crate::config::SyncConfig;
use crate::contact::{CanonicalContact, FieldName, FieldValue};
use crate::detector::{ChangeDetector, ChangeSet};
use crate::error::{SyncError, SyncResult};
use crate::mapper::FieldMapper;
use crate::matcher::{IdentityMatcher, MatchCandidate, MatchOutcome};
use crate::normalize;
use crate::resolver::{FieldDelta, MergeResolver, ResolutionKind};
use crate::run::{CancelSignal, ConflictReport, FailureReport, RunStatus, SyncPhase, SyncRun};
use crate::store::SyncStores;

type RecordKey = (DirectoryKind, NativeId);

/// Candidates collected for matching, plus records whose changes must be
/// re-delivered.
#[derive(Default)]
struct Gathered {
    messaging: Vec<MatchCandidate>,
    cloud: Vec<MatchCandidate>,
    seen: HashSet<RecordKey>,
    blocked: HashSet<RecordKey>,
}

impl Gathered {
    fn push(&mut self, candidate: MatchCandidate) {
        self.seen
            .insert((candidate.directory(), candidate.native_id().clone()));
        match candidate.directory() {
            DirectoryKind::Messaging => self.messaging.push(candidate),
            DirectoryKind::Cloud => self.cloud.push(candidate),
        }
    }

    fn contains(&self, key: &RecordKey) -> bool {
        self.seen.contains(key)
    }
}

/// Merged contacts waiting for their writes.
struct Merged {
    contacts: HashMap<ContactId, CanonicalContact>,
    /// Detected records behind each contact.
    sources: HashMap<ContactId, Vec<RecordKey>>,
    /// Stored contacts folded into another contact.
    absorbed: Vec<ContactId>,
    deltas: Vec<FieldDelta>,
    bases: BasePayloads,
}

/// Runs synchronizations between a messaging directory and a cloud directory.
pub struct SyncOrchestrator {
    config: SyncConfig,
    messaging: Arc<dyn DirectoryClient>,
    cloud: Arc<dyn DirectoryClient>,
    stores: SyncStores,
    mapper: FieldMapper,
    matcher: IdentityMatcher,
    resolver: MergeResolver,
    scheduler: BatchScheduler,
    retry: RetryPolicy,
}

impl SyncOrchestrator {
    /// Build an orchestrator from an explicit configuration.
    pub fn new(
        config: SyncConfig,
        messaging: Arc<dyn DirectoryClient>,
        cloud: Arc<dyn DirectoryClient>,
        stores: SyncStores,
    ) -> SyncResult<Self> {
        config.validate()?;
        if messaging.kind() != DirectoryKind::Messaging || cloud.kind() != DirectoryKind::Cloud {
            return Err(SyncError::configuration(format!(
                "directory clients given as ({}, {}), expected (messaging, cloud)",
                messaging.kind(),
                cloud.kind()
            )));
        }

        let scheduler = BatchScheduler::new(&config, Arc::clone(&messaging), Arc::clone(&cloud));
        Ok(Self {
            matcher: IdentityMatcher::new(config.match_confidence_threshold),
            resolver: MergeResolver::new(&config),
            retry: config.retry_policy(),
            mapper: FieldMapper::new(),
            scheduler,
            config,
            messaging,
            cloud,
            stores,
        })
    }

    /// Replace the retry policy used for every directory call.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.scheduler = self.scheduler.with_retry_policy(retry.clone());
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn client(&self, kind: DirectoryKind) -> &dyn DirectoryClient {
        match kind {
            DirectoryKind::Messaging => self.messaging.as_ref(),
            DirectoryKind::Cloud => self.cloud.as_ref(),
        }
    }

    fn detector(&self, kind: DirectoryKind) -> ChangeDetector {
        ChangeDetector::new(
            self.config.directory(kind).page_size,
            self.request_timeout(),
            self.retry.clone(),
        )
    }

    fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }

    /// Run one synchronization for `user_id`.
    pub async fn run_sync(&self, user_id: UserId) -> SyncResult<SyncRun> {
        self.run_sync_cancellable(user_id, &CancelSignal::new()).await
    }

    /// Run one synchronization that stops dispatching writes once `cancel`
    /// fires.
    ///
    /// Returns `Err` only when the run could not start, such as when another
    /// run holds the user's lock. Everything after that is reported in the
    /// returned [`SyncRun`].
    #[instrument(skip(self, cancel), fields(user_id = %user_id))]
    pub async fn run_sync_cancellable(
        &self,
        user_id: UserId,
        cancel: &CancelSignal,
    ) -> SyncResult<SyncRun> {
        let lease = self.stores.locks.acquire(user_id).await?;
        let mut run = SyncRun::new(user_id);
        info!(run_id = %run.id, "Sync run started");

        if let Err(e) = self.execute(&mut run, cancel).await {
            error!(run_id = %run.id, error = %e, code = e.error_code(), "Sync run aborted");
            run.fail(&e);
        }

        if let Err(e) = self.stores.locks.release(&lease).await {
            warn!(run_id = %run.id, error = %e, "Failed to release run lock");
        }

        info!(
            run_id = %run.id,
            status = %run.status,
            total = run.counts.total,
            created = run.counts.created,
            updated = run.counts.updated,
            soft_deleted = run.counts.soft_deleted,
            conflicted = run.counts.conflicted,
            failed = run.counts.failed,
            skipped = run.counts.skipped,
            "Sync run finished"
        );
        Ok(run)
    }

    async fn execute(&self, run: &mut SyncRun, cancel: &CancelSignal) -> SyncResult<()> {
        let user_id = run.user_id;

        run.transition(SyncPhase::Detecting)?;
        let mut change_sets = Vec::with_capacity(2);
        for kind in DirectoryKind::ALL {
            let since = self.stores.watermarks.load(user_id, kind).await?;
            let changes = self
                .detector(kind)
                .detect_changes(self.client(kind), since.as_ref())
                .await?;
            run.counts.total += changes.len();
            change_sets.push(changes);
        }

        run.transition(SyncPhase::Matching)?;
        let mut gathered = self.gather(run, &change_sets).await?;
        let messaging = std::mem::take(&mut gathered.messaging);
        let cloud = std::mem::take(&mut gathered.cloud);
        let outcome = self.matcher.match_records(messaging, cloud);
        self.report_conflicts(run, &outcome, &mut gathered.blocked);

        run.transition(SyncPhase::Merging)?;
        let merged = self.merge(run, outcome).await?;

        run.transition(SyncPhase::Applying)?;
        let deltas = merged.deltas.clone();
        let result = if deltas.is_empty() {
            BatchResult::default()
        } else {
            self.scheduler.apply(deltas, &merged.bases, cancel).await
        };
        let mut blocked = gathered.blocked;
        self.persist(run, merged, &result, &mut blocked).await?;
        if let Some(fatal) = result.fatal {
            return Err(fatal.into());
        }

        run.transition(SyncPhase::Committing)?;
        for changes in &change_sets {
            let blocked_ids: HashSet<NativeId> = blocked
                .iter()
                .filter(|(kind, _)| *kind == changes.directory)
                .map(|(_, id)| id.clone())
                .collect();
            if let Some(watermark) = changes.committable_watermark(&blocked_ids) {
                self.stores
                    .watermarks
                    .commit(user_id, changes.directory, &watermark)
                    .await?;
                run.committed_watermarks.push((changes.directory, watermark));
            }
        }

        run.transition(SyncPhase::Idle)?;
        let status = if cancel.is_cancelled() && !result.cancelled.is_empty() {
            RunStatus::Cancelled
        } else if blocked.is_empty() && run.failures.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::PartiallyCompleted
        };
        run.finish(status);
        Ok(())
    }

    async fn fetch(&self, kind: DirectoryKind, native_id: &NativeId) -> DirectoryResult<Option<DirectoryRecord>> {
        let client = self.client(kind);
        let timeout = self.request_timeout();
        self.retry
            .execute(|| with_timeout(timeout, client.fetch_record(native_id)))
            .await
    }

    fn candidate(&self, record: DirectoryRecord) -> Result<MatchCandidate, SyncError> {
        let fields = match &record.payload {
            Some(payload) => self.mapper.fields(payload)?,
            None => Default::default(),
        };
        Ok(MatchCandidate::new(record, fields))
    }

    /// Map detected records, attach their links, and add the other-directory
    /// records the resolver needs to see.
    async fn gather(&self, run: &mut SyncRun, change_sets: &[ChangeSet]) -> SyncResult<Gathered> {
        let user_id = run.user_id;
        let contacts = &self.stores.contacts;
        let mut gathered = Gathered::default();

        for changes in change_sets {
            for record in changes.latest_records() {
                let kind = record.directory;
                let native_id = record.native_id.clone();
                let mut candidate = match self.candidate(record) {
                    Ok(candidate) => candidate,
                    Err(e) => {
                        warn!(directory = %kind, native_id = %native_id, error = %e, "Skipping malformed record");
                        run.skip(kind, native_id, e.to_string());
                        continue;
                    }
                };
                match contacts.find_by_link(user_id, kind, &native_id).await? {
                    Some(contact) => {
                        let counterpart = contact.native_id(kind.other()).cloned();
                        candidate = candidate.with_link(contact.id, counterpart);
                    }
                    None if candidate.record.is_tombstone() => {
                        debug!(directory = %kind, native_id = %native_id, "Ignoring deletion of unsynced record");
                        run.skip(kind, native_id, "deleted before it was synchronized");
                        continue;
                    }
                    None => {}
                }
                gathered.push(candidate);
            }
        }

        self.hydrate_counterparts(run, &mut gathered).await?;
        self.expand_candidates(run, &mut gathered).await?;
        Ok(gathered)
    }

    /// Read the unchanged side of every linked contact.
    async fn hydrate_counterparts(&self, run: &mut SyncRun, gathered: &mut Gathered) -> SyncResult<()> {
        let wanted: Vec<(RecordKey, RecordKey, ContactId)> = gathered
            .messaging
            .iter()
            .chain(gathered.cloud.iter())
            .filter_map(|c| {
                let link = c.link.as_ref()?;
                let counterpart = link.counterpart.clone()?;
                Some((
                    (c.directory().other(), counterpart),
                    (c.directory(), c.native_id().clone()),
                    link.contact_id,
                ))
            })
            .collect();

        for (key, source, contact_id) in wanted {
            if gathered.contains(&key) {
                continue;
            }
            let (kind, native_id) = key;
            let record = match self.fetch(kind, &native_id).await {
                Ok(Some(record)) => record,
                Ok(None) => DirectoryRecord::tombstone(kind, native_id.clone(), Utc::now()),
                Err(e) if e.is_auth_failure() => return Err(e.into()),
                Err(e) => {
                    warn!(directory = %kind, native_id = %native_id, error = %e, "Counterpart unavailable, deferring contact");
                    self.defer(run, gathered, &source, e.to_string());
                    continue;
                }
            };
            match self.candidate(record) {
                Ok(candidate) => {
                    gathered.push(candidate.with_link(contact_id, Some(source.1.clone())));
                }
                Err(e) => {
                    warn!(directory = %kind, native_id = %native_id, error = %e, "Skipping malformed counterpart");
                    run.skip(kind, native_id, e.to_string());
                }
            }
        }
        Ok(())
    }

    /// Offer records of stored contacts that share a phone or email with an
    /// unlinked detected record, so they can match instead of duplicating.
    async fn expand_candidates(&self, run: &mut SyncRun, gathered: &mut Gathered) -> SyncResult<()> {
        let user_id = run.user_id;
        let lookups: Vec<(DirectoryKind, Vec<String>, Vec<String>)> = gathered
            .messaging
            .iter()
            .chain(gathered.cloud.iter())
            .filter(|c| c.link.is_none() && !c.record.is_deleted())
            .map(|c| {
                (
                    c.directory(),
                    field_keys(&c.fields, FieldName::Phones),
                    field_keys(&c.fields, FieldName::Emails),
                )
            })
            .collect();

        for (kind, phones, emails) in lookups {
            let other = kind.other();
            let found = self
                .stores
                .contacts
                .find_candidates(user_id, &phones, &emails)
                .await?;
            for contact in found {
                if contact.link(kind).is_some() {
                    continue;
                }
                let Some(native_id) = contact.native_id(other).cloned() else {
                    continue;
                };
                let key = (other, native_id.clone());
                if gathered.contains(&key) {
                    continue;
                }
                match self.fetch(other, &native_id).await {
                    Ok(Some(record)) if !record.is_deleted() => {
                        if let Ok(candidate) = self.candidate(record) {
                            gathered.push(candidate.with_link(contact.id, None));
                        }
                    }
                    Ok(_) => {}
                    Err(e) if e.is_auth_failure() => return Err(e.into()),
                    Err(e) => {
                        debug!(directory = %other, native_id = %native_id, error = %e, "Skipping candidate expansion");
                    }
                }
            }
        }
        Ok(())
    }

    fn defer(&self, run: &mut SyncRun, gathered: &mut Gathered, source: &RecordKey, reason: String) {
        gathered.blocked.insert(source.clone());
        let list = match source.0 {
            DirectoryKind::Messaging => &mut gathered.messaging,
            DirectoryKind::Cloud => &mut gathered.cloud,
        };
        list.retain(|c| c.native_id() != &source.1);
        run.skip(source.0, source.1.clone(), reason);
    }

    /// Record each ambiguous match and hold its records back from the
    /// watermark, so the conflict is reported again until someone resolves it.
    fn report_conflicts(
        &self,
        run: &mut SyncRun,
        outcome: &MatchOutcome,
        blocked: &mut HashSet<RecordKey>,
    ) {
        for conflict in &outcome.conflicts {
            let records: Vec<RecordKey> = conflict
                .records
                .iter()
                .map(|c| (c.directory(), c.native_id().clone()))
                .collect();
            blocked.extend(records.iter().cloned());
            run.counts.conflicted += 1;
            run.conflicts.push(ConflictReport {
                records,
                signal: conflict.signal.as_str().to_string(),
                reason: conflict.reason.clone(),
            });
        }
    }

    async fn merge(&self, run: &mut SyncRun, outcome: MatchOutcome) -> SyncResult<Merged> {
        let user_id = run.user_id;
        let mut merged = Merged {
            contacts: HashMap::new(),
            sources: HashMap::new(),
            absorbed: Vec::new(),
            deltas: Vec::new(),
            bases: BasePayloads::new(),
        };

        for group in outcome.groups {
            let previous = match group.contact_id {
                Some(id) => self.stores.contacts.get(user_id, id).await?,
                None => None,
            };
            let resolution = self.resolver.resolve(&group, previous.as_ref());
            let contact_id = resolution.contact.id;

            if group.is_pair() {
                run.counts.matched += 1;
            }
            match resolution.kind {
                ResolutionKind::Created => run.counts.created += 1,
                ResolutionKind::Updated => run.counts.updated += 1,
                ResolutionKind::SoftDeleted => run.counts.soft_deleted += 1,
                ResolutionKind::Unchanged => run.counts.unchanged += 1,
                ResolutionKind::Skipped => {
                    for side in group.records() {
                        run.skip(side.directory(), side.native_id().clone(), "nothing to propagate");
                    }
                    continue;
                }
            }
            if let Err(e) = resolution.contact.validate() {
                warn!(contact_id = %contact_id, error = %e, "Dropping invalid merge result");
                continue;
            }

            for side in group.records() {
                if let Some(linked) = side.link.as_ref().map(|l| l.contact_id) {
                    if linked != contact_id && !merged.absorbed.contains(&linked) {
                        merged.absorbed.push(linked);
                    }
                }
                if let Some(payload) = &side.record.payload {
                    merged
                        .bases
                        .insert((side.directory(), side.native_id().clone()), payload.clone());
                }
                merged
                    .sources
                    .entry(contact_id)
                    .or_default()
                    .push((side.directory(), side.native_id().clone()));
            }

            merged.deltas.extend(resolution.deltas);
            merged.contacts.insert(contact_id, resolution.contact);
        }

        debug!(
            contacts = merged.contacts.len(),
            deltas = merged.deltas.len(),
            "Merge complete"
        );
        Ok(merged)
    }

    /// Record write outcomes on the merged contacts and store them.
    async fn persist(
        &self,
        run: &mut SyncRun,
        mut merged: Merged,
        result: &BatchResult,
        blocked: &mut HashSet<RecordKey>,
    ) -> SyncResult<()> {
        let user_id = run.user_id;

        for applied in &result.applied {
            if let Some(contact) = merged.contacts.get_mut(&applied.unit.contact_id) {
                contact.set_link(
                    applied.unit.directory,
                    applied.receipt.native_id.clone(),
                    Some(applied.receipt.revision.clone()),
                );
            }
        }

        let report = |failed: &FailedWrite, requeued: bool, run: &mut SyncRun| {
            run.counts.failed += 1;
            run.failures.push(FailureReport {
                contact_id: failed.unit.contact_id,
                directory: failed.unit.directory,
                target: failed.unit.target.clone(),
                fields: failed.unit.fields(),
                error_code: failed.error.error_code().to_string(),
                message: failed.error.to_string(),
                requeued,
            });
        };
        for failed in &result.failed {
            report(failed, false, run);
        }
        for failed in &result.retriable {
            report(failed, true, run);
        }
        for unit in &result.cancelled {
            run.failures.push(FailureReport {
                contact_id: unit.contact_id,
                directory: unit.directory,
                target: unit.target.clone(),
                fields: unit.fields(),
                error_code: "CANCELLED".to_string(),
                message: "write not dispatched".to_string(),
                requeued: true,
            });
        }

        for unit in result.unapplied_units() {
            if let Some(sources) = merged.sources.get(&unit.contact_id) {
                blocked.extend(sources.iter().cloned());
            }
        }

        for id in merged.absorbed.drain(..) {
            if !merged.contacts.contains_key(&id) {
                self.stores.contacts.remove(user_id, id).await?;
            }
        }
        for contact in merged.contacts.values() {
            self.stores.contacts.save(user_id, contact).await?;
        }
        Ok(())
    }
}

fn field_keys(fields: &crate::mapper::FieldMap, field: FieldName) -> Vec<String> {
    match fields.get(&field) {
        Some(FieldValue::List(items)) => items
            .iter()
            .map(|v| normalize::list_key(field, v))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        ContactStore, InMemoryContactStore, InMemoryRunLock, InMemoryWatermarkStore, RunLock,
    };
    use contactsync_directory::memory::InMemoryDirectory;
    use contactsync_directory::payload::{
        CloudName, CloudPerson, CloudValue, MessagingContact, NativePayload,
    };
    use contactsync_directory::resilience::no_jitter;

    fn fast() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(1)).with_jitter(no_jitter())
    }

    fn orchestrator(
        messaging: &Arc<InMemoryDirectory>,
        cloud: &Arc<InMemoryDirectory>,
        stores: SyncStores,
    ) -> SyncOrchestrator {
        SyncOrchestrator::new(SyncConfig::default(), messaging.clone(), cloud.clone(), stores)
            .unwrap()
            .with_retry_policy(fast())
    }

    #[tokio::test]
    async fn test_rejects_swapped_clients() {
        let messaging = Arc::new(InMemoryDirectory::new(DirectoryKind::Messaging));
        let cloud = Arc::new(InMemoryDirectory::new(DirectoryKind::Cloud));
        let result = SyncOrchestrator::new(
            SyncConfig::default(),
            cloud.clone(),
            messaging.clone(),
            SyncStores::in_memory(),
        );
        assert!(matches!(result, Err(SyncError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_empty_directories_complete() {
        let messaging = Arc::new(InMemoryDirectory::new(DirectoryKind::Messaging));
        let cloud = Arc::new(InMemoryDirectory::new(DirectoryKind::Cloud));
        let run = orchestrator(&messaging, &cloud, SyncStores::in_memory())
            .run_sync(UserId::new())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.phase, SyncPhase::Idle);
        assert_eq!(run.counts.total, 0);
    }

    #[tokio::test]
    async fn test_creates_missing_side_and_links() {
        let messaging = Arc::new(InMemoryDirectory::new(DirectoryKind::Messaging));
        let cloud = Arc::new(InMemoryDirectory::new(DirectoryKind::Cloud));
        messaging
            .upsert(
                "m1",
                NativePayload::Messaging(MessagingContact {
                    first_name: Some("Ada".into()),
                    last_name: Some("Lovelace".into()),
                    phone: Some("+441234567890".into()),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        let contacts = Arc::new(InMemoryContactStore::new());
        let stores = SyncStores {
            contacts: contacts.clone(),
            ..SyncStores::in_memory()
        };
        let user = UserId::new();
        let run = orchestrator(&messaging, &cloud, stores)
            .run_sync(user)
            .await
            .unwrap();

        assert_eq!(run.counts.created, 1);
        let people = cloud.snapshot().await;
        assert_eq!(people.len(), 1);
        let stored = contacts.list(user).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(
            stored[0].native_id(DirectoryKind::Cloud),
            Some(&people[0].native_id)
        );
    }

    #[tokio::test]
    async fn test_already_running_fails_fast() {
        let messaging = Arc::new(InMemoryDirectory::new(DirectoryKind::Messaging));
        let cloud = Arc::new(InMemoryDirectory::new(DirectoryKind::Cloud));
        let locks = Arc::new(InMemoryRunLock::new());
        let user = UserId::new();
        let _held = locks.acquire(user).await.unwrap();
        let stores = SyncStores {
            locks: locks.clone(),
            ..SyncStores::in_memory()
        };
        let err = orchestrator(&messaging, &cloud, stores)
            .run_sync(user)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "ALREADY_RUNNING");
    }

    #[tokio::test]
    async fn test_store_outage_fails_without_commit() {
        let messaging = Arc::new(InMemoryDirectory::new(DirectoryKind::Messaging));
        let cloud = Arc::new(InMemoryDirectory::new(DirectoryKind::Cloud));
        cloud
            .upsert(
                "people/c1",
                NativePayload::Cloud(CloudPerson {
                    names: vec![CloudName {
                        display_name: "Grace Hopper".into(),
                        primary: true,
                    }],
                    email_addresses: vec![CloudValue::new("grace@navy.mil")],
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        let watermarks = Arc::new(InMemoryWatermarkStore::new());
        watermarks.set_offline(true);
        let locks = Arc::new(InMemoryRunLock::new());
        let stores = SyncStores {
            watermarks: watermarks.clone(),
            locks: locks.clone(),
            ..SyncStores::in_memory()
        };
        let user = UserId::new();
        let run = orchestrator(&messaging, &cloud, stores)
            .run_sync(user)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.phase, SyncPhase::Failed);
        assert!(run.committed_watermarks.is_empty());
        assert_eq!(messaging.write_count().await, 0);
        // The lease is released even when the run fails.
        assert!(!locks.is_held(user).await);
    }
}
