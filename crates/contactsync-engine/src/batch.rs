//! Batched application of field deltas.
//!
//! Deltas are folded into one write unit per target record, in the order the
//! resolver produced them. Units are chunked into batches of the directory's
//! batch size and dispatched concurrently up to its concurrency limit. A
//! record's deltas never span two batches, so concurrent batches cannot
//! reorder writes to the same record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use contactsync_directory::error::DirectoryError;
use contactsync_directory::ids::{ContactId, NativeId, Revision};
use contactsync_directory::payload::NativePayload;
use contactsync_directory::record::{WriteReceipt, WriteTarget};
use contactsync_directory::resilience::{with_timeout, RetryPolicy};
use contactsync_directory::traits::DirectoryClient;
use contactsync_directory::types::DirectoryKind;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SyncConfig;
use crate::contact::{FieldName, FieldValue};
use crate::mapper::FieldMapper;
use crate::rate_limiter::DirectoryGate;
use crate::resolver::{DeltaChange, FieldDelta};
use crate::run::CancelSignal;

/// Current payloads of write targets, keyed by directory and native ID.
pub type BasePayloads = HashMap<(DirectoryKind, NativeId), NativePayload>;

/// All deltas for one target record, written as a single full-state write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteUnit {
    pub directory: DirectoryKind,
    pub target: WriteTarget,
    pub contact_id: ContactId,
    pub deltas: Vec<FieldDelta>,
    pub expected_revision: Option<Revision>,
    pub payload: NativePayload,
}

impl WriteUnit {
    #[must_use]
    pub fn fields(&self) -> Vec<FieldName> {
        self.deltas.iter().filter_map(FieldDelta::field).collect()
    }

    #[must_use]
    pub fn is_soft_delete(&self) -> bool {
        self.deltas
            .iter()
            .any(|d| matches!(d.change, DeltaChange::SoftDelete))
    }
}

/// A unit that reached its directory.
#[derive(Debug, Clone)]
pub struct AppliedWrite {
    pub unit: WriteUnit,
    pub receipt: WriteReceipt,
}

/// A unit that did not reach its directory.
#[derive(Debug, Clone)]
pub struct FailedWrite {
    pub unit: WriteUnit,
    pub error: DirectoryError,
}

/// Outcome of applying a set of deltas.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub applied: Vec<AppliedWrite>,
    /// Permanent failures and exhausted retries.
    pub failed: Vec<FailedWrite>,
    /// Stale writes, re-resolved by the next run.
    pub retriable: Vec<FailedWrite>,
    /// Units never dispatched because the run was cancelled or aborted.
    pub cancelled: Vec<WriteUnit>,
    /// Authentication or authorization failure that aborted dispatch.
    pub fatal: Option<DirectoryError>,
}

impl BatchResult {
    #[must_use]
    pub fn applied_deltas(&self) -> usize {
        self.applied.iter().map(|a| a.unit.deltas.len()).sum()
    }

    /// Everything that did not land in this run.
    pub fn unapplied_units(&self) -> impl Iterator<Item = &WriteUnit> {
        self.failed
            .iter()
            .chain(self.retriable.iter())
            .map(|f| &f.unit)
            .chain(self.cancelled.iter())
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
            && self.retriable.is_empty()
            && self.cancelled.is_empty()
            && self.fatal.is_none()
    }
}

enum UnitOutcome {
    Applied(AppliedWrite),
    Failed(FailedWrite),
    Retriable(FailedWrite),
    Cancelled(WriteUnit),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum UnitKey {
    Existing(DirectoryKind, NativeId),
    Create(DirectoryKind, ContactId),
}

#[derive(Clone)]
struct DirectoryLane {
    client: Arc<dyn DirectoryClient>,
    gate: DirectoryGate,
    batch_size: usize,
}

/// Dispatches write units to both directories.
pub struct BatchScheduler {
    lanes: HashMap<DirectoryKind, DirectoryLane>,
    retry: RetryPolicy,
    request_timeout: Duration,
    mapper: FieldMapper,
}

impl BatchScheduler {
    #[must_use]
    pub fn new(
        config: &SyncConfig,
        messaging: Arc<dyn DirectoryClient>,
        cloud: Arc<dyn DirectoryClient>,
    ) -> Self {
        let lanes = [(DirectoryKind::Messaging, messaging), (DirectoryKind::Cloud, cloud)]
            .into_iter()
            .map(|(kind, client)| {
                let directory = config.directory(kind);
                (
                    kind,
                    DirectoryLane {
                        client,
                        gate: DirectoryGate::from_config(directory),
                        batch_size: directory.batch_size.max(1),
                    },
                )
            })
            .collect();
        Self {
            lanes,
            retry: config.retry_policy(),
            request_timeout: config.request_timeout(),
            mapper: FieldMapper::new(),
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fold deltas into write units, in first-seen order.
    ///
    /// Units targeting a record with no known base payload are returned
    /// separately; writing them would replace the record with a partial state.
    #[must_use]
    pub fn plan(&self, deltas: Vec<FieldDelta>, bases: &BasePayloads) -> (Vec<WriteUnit>, Vec<FailedWrite>) {
        let mut order: Vec<UnitKey> = Vec::new();
        let mut grouped: HashMap<UnitKey, Vec<FieldDelta>> = HashMap::new();
        for delta in deltas {
            let key = match &delta.target_id {
                WriteTarget::Existing(id) => UnitKey::Existing(delta.target, id.clone()),
                WriteTarget::Create => UnitKey::Create(delta.target, delta.contact_id),
            };
            grouped
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push(key);
                    Vec::new()
                })
                .push(delta);
        }

        let mut units = Vec::new();
        let mut orphans = Vec::new();
        for key in order {
            let Some(deltas) = grouped.remove(&key) else {
                continue;
            };
            let (directory, target, base) = match &key {
                UnitKey::Existing(kind, id) => (
                    *kind,
                    WriteTarget::Existing(id.clone()),
                    bases.get(&(*kind, id.clone())),
                ),
                UnitKey::Create(kind, _) => (*kind, WriteTarget::Create, None),
            };
            let contact_id = deltas[0].contact_id;
            let expected_revision = deltas[0].expected_revision.clone();
            let changes: Vec<(FieldName, FieldValue)> = deltas
                .iter()
                .filter_map(|d| match &d.change {
                    DeltaChange::Set { field, value } => Some((*field, value.clone())),
                    DeltaChange::SoftDelete => None,
                })
                .collect();
            if base.is_none() && matches!(target, WriteTarget::Existing(_)) {
                let error = DirectoryError::invalid_data(format!(
                    "no current snapshot of {directory} record {target}"
                ));
                orphans.push(FailedWrite {
                    unit: WriteUnit {
                        directory,
                        target,
                        contact_id,
                        deltas,
                        expected_revision,
                        payload: NativePayload::empty(directory),
                    },
                    error,
                });
                continue;
            }

            let mut payload = self.mapper.apply(base, directory, &changes);
            if deltas
                .iter()
                .any(|d| matches!(d.change, DeltaChange::SoftDelete))
            {
                payload.set_archived(true);
            }
            units.push(WriteUnit {
                directory,
                target,
                contact_id,
                deltas,
                expected_revision,
                payload,
            });
        }
        (units, orphans)
    }

    /// Apply `deltas` against `bases`.
    ///
    /// Cancellation stops dispatching batches that have not started; batches
    /// already writing run to completion. An authentication failure stops
    /// dispatch the same way and is reported in [`BatchResult::fatal`].
    #[instrument(skip_all, fields(deltas = deltas.len()))]
    pub async fn apply(
        &self,
        deltas: Vec<FieldDelta>,
        bases: &BasePayloads,
        cancel: &CancelSignal,
    ) -> BatchResult {
        let (units, orphans) = self.plan(deltas, bases);
        let mut result = BatchResult {
            failed: orphans,
            ..Default::default()
        };
        let aborted = Arc::new(AtomicBool::new(false));

        let mut tasks: JoinSet<(usize, Vec<UnitOutcome>)> = JoinSet::new();
        let mut pending: HashMap<usize, Vec<WriteUnit>> = HashMap::new();
        for kind in DirectoryKind::ALL {
            let Some(lane) = self.lanes.get(&kind) else {
                continue;
            };
            let lane_units: Vec<WriteUnit> = units.iter().filter(|u| u.directory == kind).cloned().collect();
            for chunk in lane_units.chunks(lane.batch_size) {
                let index = pending.len();
                pending.insert(index, chunk.to_vec());
                let batch = run_batch(
                    lane.clone(),
                    chunk.to_vec(),
                    self.retry.clone(),
                    self.request_timeout,
                    cancel.clone(),
                    Arc::clone(&aborted),
                );
                tasks.spawn(async move { (index, batch.await) });
            }
        }
        debug!(batches = pending.len(), units = units.len(), "Dispatching write batches");

        while let Some(joined) = tasks.join_next().await {
            let (index, outcomes) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Write batch task failed");
                    continue;
                }
            };
            pending.remove(&index);
            for outcome in outcomes {
                match outcome {
                    UnitOutcome::Applied(applied) => result.applied.push(applied),
                    UnitOutcome::Retriable(failed) => result.retriable.push(failed),
                    UnitOutcome::Failed(failed) => {
                        if failed.error.is_auth_failure() && result.fatal.is_none() {
                            result.fatal = Some(failed.error.clone());
                        }
                        result.failed.push(failed);
                    }
                    UnitOutcome::Cancelled(unit) => result.cancelled.push(unit),
                }
            }
        }

        // Batches whose task died report nothing; their writes are unknown.
        let mut lost: Vec<usize> = pending.keys().copied().collect();
        lost.sort_unstable();
        for index in lost {
            if let Some(chunk) = pending.remove(&index) {
                result.cancelled.extend(chunk);
            }
        }

        info!(
            applied = result.applied.len(),
            failed = result.failed.len(),
            retriable = result.retriable.len(),
            cancelled = result.cancelled.len(),
            "Write batches finished"
        );
        result
    }
}

async fn run_batch(
    lane: DirectoryLane,
    units: Vec<WriteUnit>,
    retry: RetryPolicy,
    request_timeout: Duration,
    cancel: CancelSignal,
    aborted: Arc<AtomicBool>,
) -> Vec<UnitOutcome> {
    let _permit = lane.gate.enter().await;
    if cancel.is_cancelled() || aborted.load(Ordering::SeqCst) {
        return units.into_iter().map(UnitOutcome::Cancelled).collect();
    }

    let mut outcomes = Vec::with_capacity(units.len());
    for unit in units {
        lane.gate.throttle().await;
        let result = retry
            .execute(|| {
                with_timeout(
                    request_timeout,
                    lane.client.write_record(
                        &unit.target,
                        unit.payload.clone(),
                        unit.expected_revision.as_ref(),
                    ),
                )
            })
            .await;

        outcomes.push(match result {
            Ok(receipt) => {
                debug!(
                    directory = %unit.directory,
                    native_id = %receipt.native_id,
                    revision = %receipt.revision,
                    "Write applied"
                );
                UnitOutcome::Applied(AppliedWrite { unit, receipt })
            }
            Err(error) if error.is_stale_write() || matches!(error, DirectoryError::NotFound { .. }) => {
                warn!(
                    directory = %unit.directory,
                    target = %unit.target,
                    error = %error,
                    "Write rejected, re-queued for next run"
                );
                UnitOutcome::Retriable(FailedWrite { unit, error })
            }
            Err(error) => {
                if error.is_auth_failure() {
                    aborted.store(true, Ordering::SeqCst);
                    error!(directory = %unit.directory, error = %error, "Directory rejected credentials");
                } else {
                    warn!(
                        directory = %unit.directory,
                        target = %unit.target,
                        error = %error,
                        "Write failed"
                    );
                }
                UnitOutcome::Failed(FailedWrite { unit, error })
            }
        });
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectoryConfig;
    use contactsync_directory::memory::InMemoryDirectory;
    use contactsync_directory::payload::{CloudPerson, MessagingContact};
    use contactsync_directory::resilience::no_jitter;

    fn config(batch_size: usize) -> SyncConfig {
        let mut config = SyncConfig::default();
        let directory = DirectoryConfig {
            batch_size,
            max_concurrency: 2,
            ..Default::default()
        };
        config.directories.messaging = directory.clone();
        config.directories.cloud = directory;
        config
    }

    fn scheduler(
        batch_size: usize,
        messaging: &Arc<InMemoryDirectory>,
        cloud: &Arc<InMemoryDirectory>,
    ) -> BatchScheduler {
        BatchScheduler::new(&config(batch_size), messaging.clone(), cloud.clone())
            .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(1)).with_jitter(no_jitter()))
    }

    fn set(contact: ContactId, id: &str, field: FieldName, value: &str, rev: &str) -> FieldDelta {
        FieldDelta {
            contact_id: contact,
            target: DirectoryKind::Messaging,
            target_id: WriteTarget::Existing(NativeId::new(id)),
            change: DeltaChange::Set {
                field,
                value: FieldValue::Text(value.into()),
            },
            expected_revision: Some(Revision::new(rev)),
        }
    }

    fn person(first: &str) -> NativePayload {
        NativePayload::Messaging(MessagingContact {
            first_name: Some(first.into()),
            ..Default::default()
        })
    }

    async fn seeded() -> (Arc<InMemoryDirectory>, Arc<InMemoryDirectory>, BasePayloads) {
        let messaging = Arc::new(InMemoryDirectory::new(DirectoryKind::Messaging));
        let cloud = Arc::new(InMemoryDirectory::new(DirectoryKind::Cloud));
        let mut bases = BasePayloads::new();
        for id in ["a", "b", "c"] {
            messaging.upsert(id, person(id)).await.unwrap();
            bases.insert((DirectoryKind::Messaging, NativeId::new(id)), person(id));
        }
        (messaging, cloud, bases)
    }

    #[tokio::test]
    async fn test_plan_groups_per_record_in_order() {
        let (messaging, cloud, bases) = seeded().await;
        let contact = ContactId::new();
        let deltas = vec![
            set(contact, "a", FieldName::Organization, "Acme", "1"),
            set(contact, "b", FieldName::Organization, "Initech", "1"),
            set(contact, "a", FieldName::Notes, "hello", "1"),
        ];
        let (units, orphans) = scheduler(10, &messaging, &cloud).plan(deltas, &bases);
        assert!(orphans.is_empty());
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].target, WriteTarget::Existing(NativeId::new("a")));
        assert_eq!(units[0].fields(), vec![FieldName::Organization, FieldName::Notes]);
        match &units[0].payload {
            NativePayload::Messaging(c) => {
                assert_eq!(c.first_name.as_deref(), Some("a"));
                assert_eq!(c.company.as_deref(), Some("Acme"));
                assert_eq!(c.notes.as_deref(), Some("hello"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_base_is_not_written() {
        let (messaging, cloud, _) = seeded().await;
        let deltas = vec![set(ContactId::new(), "a", FieldName::Notes, "x", "1")];
        let result = scheduler(10, &messaging, &cloud)
            .apply(deltas, &BasePayloads::new(), &CancelSignal::new())
            .await;
        assert_eq!(result.failed.len(), 1);
        assert_eq!(messaging.write_count().await, 0);
    }

    #[tokio::test]
    async fn test_applies_all_units_across_batches() {
        let (messaging, cloud, bases) = seeded().await;
        let deltas = ["a", "b", "c"]
            .iter()
            .map(|id| set(ContactId::new(), id, FieldName::Organization, "Acme", "1"))
            .collect();
        let result = scheduler(1, &messaging, &cloud)
            .apply(deltas, &bases, &CancelSignal::new())
            .await;
        assert_eq!(result.applied.len(), 3);
        assert!(result.is_clean());
        assert_eq!(messaging.write_count().await, 3);
    }

    #[tokio::test]
    async fn test_stale_write_is_retriable_and_isolated() {
        let (messaging, cloud, bases) = seeded().await;
        // "b" changed since it was read.
        messaging.upsert("b", person("b2")).await.unwrap();
        let deltas = ["a", "b", "c"]
            .iter()
            .map(|id| set(ContactId::new(), id, FieldName::Organization, "Acme", "1"))
            .collect();
        let result = scheduler(10, &messaging, &cloud)
            .apply(deltas, &bases, &CancelSignal::new())
            .await;
        assert_eq!(result.applied.len(), 2);
        assert_eq!(result.retriable.len(), 1);
        assert!(result.retriable[0].error.is_stale_write());
        assert!(result.failed.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (messaging, cloud, bases) = seeded().await;
        messaging.fail_next_writes(2).await;
        let deltas = vec![set(ContactId::new(), "a", FieldName::Notes, "x", "1")];
        let result = scheduler(10, &messaging, &cloud)
            .apply(deltas, &bases, &CancelSignal::new())
            .await;
        assert_eq!(result.applied.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_marks_failed() {
        let (messaging, cloud, bases) = seeded().await;
        messaging.fail_next_writes(10).await;
        let deltas = vec![set(ContactId::new(), "a", FieldName::Notes, "x", "1")];
        let result = scheduler(10, &messaging, &cloud)
            .apply(deltas, &bases, &CancelSignal::new())
            .await;
        assert_eq!(result.failed.len(), 1);
        assert!(matches!(
            result.failed[0].error,
            DirectoryError::RetriesExhausted { attempts: 3, .. }
        ));
        assert!(result.fatal.is_none());
    }

    #[tokio::test]
    async fn test_auth_failure_is_fatal() {
        let (messaging, cloud, bases) = seeded().await;
        messaging.revoke_auth().await;
        let deltas = vec![set(ContactId::new(), "a", FieldName::Notes, "x", "1")];
        let result = scheduler(10, &messaging, &cloud)
            .apply(deltas, &bases, &CancelSignal::new())
            .await;
        assert!(result.fatal.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let (messaging, cloud, bases) = seeded().await;
        let cancel = CancelSignal::new();
        cancel.cancel();
        let deltas = vec![set(ContactId::new(), "a", FieldName::Notes, "x", "1")];
        let result = scheduler(10, &messaging, &cloud)
            .apply(deltas, &bases, &cancel)
            .await;
        assert_eq!(result.cancelled.len(), 1);
        assert_eq!(messaging.write_count().await, 0);
    }

    #[tokio::test]
    async fn test_create_and_soft_delete() {
        let (messaging, cloud, bases) = seeded().await;
        let contact = ContactId::new();
        let deltas = vec![
            FieldDelta {
                contact_id: contact,
                target: DirectoryKind::Cloud,
                target_id: WriteTarget::Create,
                change: DeltaChange::Set {
                    field: FieldName::Name,
                    value: FieldValue::Text("Jane Doe".into()),
                },
                expected_revision: None,
            },
            FieldDelta {
                contact_id: ContactId::new(),
                target: DirectoryKind::Messaging,
                target_id: WriteTarget::Existing(NativeId::new("c")),
                change: DeltaChange::SoftDelete,
                expected_revision: Some(Revision::new("1")),
            },
        ];
        let result = scheduler(10, &messaging, &cloud)
            .apply(deltas, &bases, &CancelSignal::new())
            .await;
        assert_eq!(result.applied.len(), 2);
        assert_eq!(cloud.snapshot().await.len(), 1);
        assert!(matches!(
            cloud.snapshot().await[0].payload,
            Some(NativePayload::Cloud(CloudPerson { .. }))
        ));
        let archived = messaging.get(&NativeId::new("c")).await.unwrap();
        assert!(archived.is_archived());
    }
}
