//! # Contact Sync Engine
//!
//! Bidirectional synchronization between a messaging-platform contact list
//! and a cloud contacts directory.
//!
//! A run detects changes on both sides since the last committed watermarks,
//! pairs records that describe the same person, merges them into one
//! canonical contact, writes the resulting deltas back in rate-limited
//! batches and finally advances the watermarks past everything that landed.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐     ┌──────────────────┐     ┌────────────────┐
//! │ ChangeDetector │────►│ IdentityMatcher  │────►│ MergeResolver  │
//! │ (per directory)│     │ (phone/email/    │     │ (field rules,  │
//! └────────────────┘     │  fuzzy name)     │     │  soft delete)  │
//!         ▲              └──────────────────┘     └───────┬────────┘
//!         │                                               │ FieldDelta
//! ┌───────┴────────┐     ┌──────────────────┐     ┌───────▼────────┐
//! │ WatermarkStore │◄────│ SyncOrchestrator │────►│ BatchScheduler │
//! └────────────────┘     └──────────────────┘     └────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use contactsync_engine::prelude::*;
//!
//! let config = SyncConfig::from_file("config/contactsync.yaml")?;
//! let orchestrator = SyncOrchestrator::new(
//!     config,
//!     Arc::new(messaging_client),
//!     Arc::new(cloud_client),
//!     SyncStores::in_memory(),
//! )?;
//!
//! let run = orchestrator.run_sync(user_id).await?;
//! println!("{} created, {} updated", run.counts.created, run.counts.updated);
//! ```

pub mod batch;
pub mod config;
pub mod contact;
pub mod detector;
pub mod error;
pub mod fuzzy;
pub mod mapper;
pub mod matcher;
pub mod normalize;
pub mod orchestrator;
pub mod poller;
pub mod rate_limiter;
pub mod resolver;
pub mod run;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::batch::{BatchResult, BatchScheduler, WriteUnit};
    pub use crate::config::{DirectoryConfig, SyncConfig};
    pub use crate::contact::{CanonicalContact, FieldName, FieldValue, Provenance};
    pub use crate::detector::{ChangeDetector, ChangeSet};
    pub use crate::error::{SchemaError, StoreError, StoreResult, SyncError, SyncResult};
    pub use crate::mapper::{FieldMap, FieldMapper};
    pub use crate::matcher::{IdentityMatcher, MatchGroup, MatchOutcome, MatchSignal};
    pub use crate::orchestrator::SyncOrchestrator;
    pub use crate::poller::SyncPoller;
    pub use crate::resolver::{DeltaChange, FieldDelta, MergeResolver, ResolutionKind};
    pub use crate::run::{CancelSignal, RunCounts, RunStatus, SyncPhase, SyncRun};
    pub use crate::store::{ContactStore, RunLock, SyncStores, WatermarkStore};

    pub use contactsync_directory::prelude::*;
}

pub use error::{SyncError, SyncResult};
pub use orchestrator::SyncOrchestrator;
