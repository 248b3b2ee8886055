//! Storage interfaces: watermarks, the per-user run lock and canonical
//! contacts, with in-memory implementations.
//!
//! Watermarks and the run lock are the only state shared between runs.
//! Both are single-writer: a watermark is committed by the run holding the
//! user's lease.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use contactsync_directory::ids::{ContactId, NativeId, UserId, Watermark};
use contactsync_directory::types::DirectoryKind;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::contact::{CanonicalContact, FieldName, FieldValue};
use crate::error::{StoreError, StoreResult};
use crate::normalize;

/// Durable per-user, per-directory watermarks.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn load(&self, user_id: UserId, directory: DirectoryKind) -> StoreResult<Option<Watermark>>;

    /// Atomically replace the stored watermark.
    async fn commit(
        &self,
        user_id: UserId,
        directory: DirectoryKind,
        watermark: &Watermark,
    ) -> StoreResult<()>;
}

/// Proof of holding a user's run lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: Uuid,
    pub user_id: UserId,
    pub acquired_at: DateTime<Utc>,
}

/// At most one in-flight run per user.
#[async_trait]
pub trait RunLock: Send + Sync {
    /// Take the user's lock, failing with `AlreadyRunning` if it is held.
    async fn acquire(&self, user_id: UserId) -> StoreResult<Lease>;

    async fn release(&self, lease: &Lease) -> StoreResult<()>;
}

/// Canonical contacts and their directory links.
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn get(&self, user_id: UserId, id: ContactId) -> StoreResult<Option<CanonicalContact>>;

    /// Contact linked to a directory record.
    async fn find_by_link(
        &self,
        user_id: UserId,
        directory: DirectoryKind,
        native_id: &NativeId,
    ) -> StoreResult<Option<CanonicalContact>>;

    /// Live contacts sharing a normalized phone or email with the given keys.
    async fn find_candidates(
        &self,
        user_id: UserId,
        phones: &[String],
        emails: &[String],
    ) -> StoreResult<Vec<CanonicalContact>>;

    async fn save(&self, user_id: UserId, contact: &CanonicalContact) -> StoreResult<()>;

    /// Drop a contact absorbed into another one.
    async fn remove(&self, user_id: UserId, id: ContactId) -> StoreResult<()>;

    async fn list(&self, user_id: UserId) -> StoreResult<Vec<CanonicalContact>>;
}

/// The three stores a run needs.
#[derive(Clone)]
pub struct SyncStores {
    pub watermarks: Arc<dyn WatermarkStore>,
    pub locks: Arc<dyn RunLock>,
    pub contacts: Arc<dyn ContactStore>,
}

impl SyncStores {
    /// Fresh in-memory stores.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            watermarks: Arc::new(InMemoryWatermarkStore::new()),
            locks: Arc::new(InMemoryRunLock::new()),
            contacts: Arc::new(InMemoryContactStore::new()),
        }
    }
}

/// Watermarks kept in a map; can be switched offline for failure tests.
#[derive(Debug, Default)]
pub struct InMemoryWatermarkStore {
    watermarks: RwLock<HashMap<(UserId, DirectoryKind), Watermark>>,
    offline: AtomicBool,
}

impl InMemoryWatermarkStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Unavailable` until set back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::unavailable("watermark store offline"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    async fn load(&self, user_id: UserId, directory: DirectoryKind) -> StoreResult<Option<Watermark>> {
        self.check_online()?;
        Ok(self.watermarks.read().await.get(&(user_id, directory)).cloned())
    }

    async fn commit(
        &self,
        user_id: UserId,
        directory: DirectoryKind,
        watermark: &Watermark,
    ) -> StoreResult<()> {
        self.check_online()?;
        self.watermarks
            .write()
            .await
            .insert((user_id, directory), watermark.clone());
        debug!(%user_id, %directory, %watermark, "Watermark committed");
        Ok(())
    }
}

/// Process-local run lock.
#[derive(Debug, Default)]
pub struct InMemoryRunLock {
    held: Mutex<HashMap<UserId, Lease>>,
}

impl InMemoryRunLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_held(&self, user_id: UserId) -> bool {
        self.held.lock().await.contains_key(&user_id)
    }
}

#[async_trait]
impl RunLock for InMemoryRunLock {
    async fn acquire(&self, user_id: UserId) -> StoreResult<Lease> {
        let mut held = self.held.lock().await;
        if held.contains_key(&user_id) {
            return Err(StoreError::AlreadyRunning { user_id });
        }
        let lease = Lease {
            id: Uuid::new_v4(),
            user_id,
            acquired_at: Utc::now(),
        };
        held.insert(user_id, lease.clone());
        Ok(lease)
    }

    async fn release(&self, lease: &Lease) -> StoreResult<()> {
        let mut held = self.held.lock().await;
        match held.get(&lease.user_id) {
            Some(current) if current.id == lease.id => {
                held.remove(&lease.user_id);
                Ok(())
            }
            _ => Err(StoreError::LeaseNotHeld {
                lease_id: lease.id.to_string(),
            }),
        }
    }
}

/// Canonical contacts kept in memory, per user.
#[derive(Debug, Default)]
pub struct InMemoryContactStore {
    contacts: RwLock<HashMap<UserId, BTreeMap<ContactId, CanonicalContact>>>,
}

impl InMemoryContactStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn list_keys(contact: &CanonicalContact, field: FieldName) -> Vec<String> {
    match contact.get(field) {
        Some(FieldValue::List(items)) => items
            .iter()
            .map(|v| normalize::list_key(field, v))
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl ContactStore for InMemoryContactStore {
    async fn get(&self, user_id: UserId, id: ContactId) -> StoreResult<Option<CanonicalContact>> {
        Ok(self
            .contacts
            .read()
            .await
            .get(&user_id)
            .and_then(|c| c.get(&id))
            .cloned())
    }

    async fn find_by_link(
        &self,
        user_id: UserId,
        directory: DirectoryKind,
        native_id: &NativeId,
    ) -> StoreResult<Option<CanonicalContact>> {
        let contacts = self.contacts.read().await;
        Ok(contacts.get(&user_id).and_then(|c| {
            c.values()
                .find(|contact| contact.native_id(directory) == Some(native_id))
                .cloned()
        }))
    }

    async fn find_candidates(
        &self,
        user_id: UserId,
        phones: &[String],
        emails: &[String],
    ) -> StoreResult<Vec<CanonicalContact>> {
        if phones.is_empty() && emails.is_empty() {
            return Ok(Vec::new());
        }
        let contacts = self.contacts.read().await;
        let Some(contacts) = contacts.get(&user_id) else {
            return Ok(Vec::new());
        };
        Ok(contacts
            .values()
            .filter(|contact| !contact.deleted)
            .filter(|contact| {
                list_keys(contact, FieldName::Phones)
                    .iter()
                    .any(|k| phones.contains(k))
                    || list_keys(contact, FieldName::Emails)
                        .iter()
                        .any(|k| emails.contains(k))
            })
            .cloned()
            .collect())
    }

    async fn save(&self, user_id: UserId, contact: &CanonicalContact) -> StoreResult<()> {
        if contact.links.is_empty() {
            return Err(StoreError::corrupted(format!(
                "refusing to store contact {} without links",
                contact.id
            )));
        }
        self.contacts
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(contact.id, contact.clone());
        Ok(())
    }

    async fn remove(&self, user_id: UserId, id: ContactId) -> StoreResult<()> {
        if let Some(contacts) = self.contacts.write().await.get_mut(&user_id) {
            contacts.remove(&id);
        }
        Ok(())
    }

    async fn list(&self, user_id: UserId) -> StoreResult<Vec<CanonicalContact>> {
        Ok(self
            .contacts
            .read()
            .await
            .get(&user_id)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }
}
