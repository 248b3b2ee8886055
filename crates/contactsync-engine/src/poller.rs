//! Periodic sync.
//!
//! Runs [`SyncOrchestrator::run_sync`] for every registered user on the
//! configured interval until shutdown is requested. A user whose previous run
//! still holds the lock is skipped for that tick.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use contactsync_directory::ids::UserId;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{StoreError, SyncError};
use crate::orchestrator::SyncOrchestrator;
use crate::run::{CancelSignal, SyncRun};

/// Background loop driving scheduled syncs.
pub struct SyncPoller {
    orchestrator: Arc<SyncOrchestrator>,
    users: RwLock<BTreeSet<UserId>>,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
    cancel: CancelSignal,
}

impl SyncPoller {
    /// Poll at the orchestrator's configured interval.
    #[must_use]
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        let poll_interval = orchestrator.config().poll_interval();
        Self {
            orchestrator,
            users: RwLock::new(BTreeSet::new()),
            poll_interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            cancel: CancelSignal::new(),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn add_user(&self, user_id: UserId) {
        self.users.write().await.insert(user_id);
    }

    pub async fn remove_user(&self, user_id: UserId) {
        self.users.write().await.remove(&user_id);
    }

    pub async fn users(&self) -> Vec<UserId> {
        self.users.read().await.iter().copied().collect()
    }

    /// Run until [`shutdown`](Self::shutdown) is called.
    #[instrument(skip(self))]
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "Starting sync poller"
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.is_shutdown() {
                info!("Poller shutdown requested, stopping poll loop");
                break;
            }
            self.poll_once().await;
        }

        info!("Sync poller stopped");
    }

    /// Sync every registered user once.
    pub async fn poll_once(&self) -> Vec<SyncRun> {
        let users = self.users().await;
        debug!(users = users.len(), "Polling users");

        let mut runs = Vec::with_capacity(users.len());
        for user_id in users {
            if self.is_shutdown() {
                break;
            }
            match self
                .orchestrator
                .run_sync_cancellable(user_id, &self.cancel)
                .await
            {
                Ok(run) => runs.push(run),
                Err(SyncError::Store(StoreError::AlreadyRunning { .. })) => {
                    warn!(user_id = %user_id, "Previous sync still running, skipping");
                }
                Err(e) => {
                    error!(user_id = %user_id, error = %e, "Scheduled sync could not start");
                }
            }
        }
        runs
    }

    /// Stop after the current tick. Writes not yet dispatched are cancelled.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.store(true, Ordering::Relaxed);
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::store::{RunLock, SyncStores};
    use contactsync_directory::memory::InMemoryDirectory;
    use contactsync_directory::payload::{MessagingContact, NativePayload};
    use contactsync_directory::types::DirectoryKind;

    fn setup(stores: SyncStores) -> (Arc<InMemoryDirectory>, Arc<InMemoryDirectory>, Arc<SyncOrchestrator>) {
        let messaging = Arc::new(InMemoryDirectory::new(DirectoryKind::Messaging));
        let cloud = Arc::new(InMemoryDirectory::new(DirectoryKind::Cloud));
        let orchestrator =
            SyncOrchestrator::new(SyncConfig::default(), messaging.clone(), cloud.clone(), stores)
                .unwrap();
        (messaging, cloud, Arc::new(orchestrator))
    }

    #[tokio::test]
    async fn test_poll_once_runs_each_user() {
        let (messaging, cloud, orchestrator) = setup(SyncStores::in_memory());
        messaging
            .upsert(
                "m1",
                NativePayload::Messaging(MessagingContact {
                    first_name: Some("Linus".into()),
                    email: Some("linus@example.org".into()),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        let poller = SyncPoller::new(orchestrator);
        let (alice, bob) = (UserId::new(), UserId::new());
        poller.add_user(alice).await;
        poller.add_user(bob).await;

        let runs = poller.poll_once().await;
        assert_eq!(runs.len(), 2);
        // Both users see the same shared directories in this setup; the first
        // run creates the cloud record, the second links it by email.
        assert_eq!(cloud.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_locked_user_is_skipped() {
        let stores = SyncStores::in_memory();
        let locks = Arc::clone(&stores.locks);
        let (_, _, orchestrator) = setup(stores);
        let poller = SyncPoller::new(orchestrator);
        let user = UserId::new();
        poller.add_user(user).await;

        let _lease = locks.acquire(user).await.unwrap();
        assert!(poller.poll_once().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let (_, _, orchestrator) = setup(SyncStores::in_memory());
        let poller = Arc::new(SyncPoller::new(orchestrator).with_poll_interval(Duration::from_millis(5)));
        poller.add_user(UserId::new()).await;

        let handle = {
            let poller = Arc::clone(&poller);
            tokio::spawn(async move { poller.run().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        poller.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(poller.is_shutdown());
    }

    #[tokio::test]
    async fn test_remove_user() {
        let (_, _, orchestrator) = setup(SyncStores::in_memory());
        let poller = SyncPoller::new(orchestrator);
        let user = UserId::new();
        poller.add_user(user).await;
        poller.remove_user(user).await;
        assert!(poller.users().await.is_empty());
    }
}
