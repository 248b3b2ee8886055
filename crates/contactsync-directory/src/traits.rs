//! Directory client trait.

use async_trait::async_trait;

use crate::error::DirectoryResult;
use crate::ids::{NativeId, Revision, Watermark};
use crate::payload::NativePayload;
use crate::record::{ChangePage, DirectoryRecord, WriteReceipt, WriteTarget};
use crate::types::DirectoryKind;

/// Access to one contact directory.
///
/// One implementation exists per directory kind. Transport details such as
/// authentication and request shape stay behind this trait.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Which directory this client talks to.
    fn kind(&self) -> DirectoryKind;

    /// List changes recorded after `since`.
    ///
    /// `None` lists every live record (initial sync). Pages hold at most
    /// `limit` entries; callers keep paging with `next_watermark` while
    /// `has_more` is set. Re-listing from the same watermark must return at
    /// least the changes returned before.
    ///
    /// Returns `InvalidWatermark` when `since` is unknown or expired.
    async fn list_changes(
        &self,
        since: Option<&Watermark>,
        limit: usize,
    ) -> DirectoryResult<ChangePage>;

    /// Read the current state of one record.
    ///
    /// Returns `Ok(None)` if the record no longer exists.
    async fn fetch_record(&self, native_id: &NativeId) -> DirectoryResult<Option<DirectoryRecord>>;

    /// Write the full desired state of one record.
    ///
    /// # Arguments
    /// * `target` - The record to replace, or `Create` for a new record
    /// * `payload` - The complete native payload to store
    /// * `expected_revision` - Optimistic-concurrency guard; a mismatch yields
    ///   `StaleWrite` and leaves the record untouched
    async fn write_record(
        &self,
        target: &WriteTarget,
        payload: NativePayload,
        expected_revision: Option<&Revision>,
    ) -> DirectoryResult<WriteReceipt>;
}
