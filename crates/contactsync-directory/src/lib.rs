//! # Contact Directory Boundary
//!
//! Everything the sync engine knows about the two contact directories it
//! reconciles: a messaging-platform contact list and a cloud contacts
//! directory.
//!
//! ## Crate Organization
//!
//! - [`ids`] - Type-safe identifiers (`UserId`, `ContactId`, `NativeId`, ...)
//! - [`types`] - Directory kinds and change kinds
//! - [`payload`] - Native payload shapes, tagged per directory
//! - [`record`] - Directory records, change pages and write receipts
//! - [`traits`] - The [`DirectoryClient`] trait
//! - [`error`] - Error types with transient/permanent classification
//! - [`resilience`] - Retry policy and request timeouts
//! - [`memory`] - In-memory directory with fault injection
//!
//! Transport clients for the real directory APIs implement
//! [`DirectoryClient`] outside this crate.

pub mod error;
pub mod ids;
pub mod memory;
pub mod payload;
pub mod record;
pub mod resilience;
pub mod traits;
pub mod types;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{DirectoryError, DirectoryResult};
    pub use crate::ids::{ContactId, NativeId, Revision, UserId, Watermark};
    pub use crate::memory::InMemoryDirectory;
    pub use crate::payload::{
        CloudBiography, CloudName, CloudOrganization, CloudPerson, CloudUrl, CloudValue,
        MessagingContact, NativePayload, SocialLink,
    };
    pub use crate::record::{ChangeEntry, ChangePage, DirectoryRecord, WriteReceipt, WriteTarget};
    pub use crate::resilience::{no_jitter, proportional_jitter, with_timeout, JitterFn, RetryPolicy};
    pub use crate::traits::DirectoryClient;
    pub use crate::types::{ChangeKind, DirectoryKind};

    pub use async_trait::async_trait;
}

pub use error::{DirectoryError, DirectoryResult};
pub use traits::DirectoryClient;
