use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::manual::{FetchedManual, ManualEntry, ManualStats, ManualStatus};

/// Persists manual entries and their download status.
///
/// Implementations must tolerate concurrent writes to distinct entries.
pub trait ManualRegistry: Send + Sync + Clone + 'static {
    /// Entries in `status`, oldest discovery first, at most `limit`.
    fn list_by_status(
        &self,
        status: ManualStatus,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ManualEntry>, AppError>> + Send;

    /// Sets the status and error text of one entry. `error: None` clears it.
    ///
    /// Returns [`AppError::NotFound`] if no entry has `id`.
    fn update_status(
        &self,
        id: &str,
        status: ManualStatus,
        error: Option<&str>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Inserts the entry, or replaces every field of the entry with the same id.
    fn save(&self, entry: &ManualEntry) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get(&self, id: &str) -> impl Future<Output = Result<Option<ManualEntry>, AppError>> + Send;

    fn stats(&self) -> impl Future<Output = Result<ManualStats, AppError>> + Send;

    /// Moves up to `limit` failed entries back to `discovered` and clears their
    /// error text. Returns the number of entries moved.
    fn requeue_failed(&self, limit: usize) -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// Downloads the document behind a manual entry to local storage.
pub trait ManualFetcher: Send + Sync + Clone + 'static {
    fn fetch(
        &self,
        cancel: CancellationToken,
        entry: ManualEntry,
    ) -> impl Future<Output = Result<FetchedManual, AppError>> + Send;
}

/// Discovers manuals published by one website or API.
///
/// Discovery only finds URLs and metadata; nothing is downloaded.
pub trait ManualSource: Send + Sync {
    /// Source identifier (e.g. "ford", "archive").
    fn name(&self) -> &str;

    fn discover(
        &self,
        cancel: &CancellationToken,
        makes: &[String],
        years: &[i32],
    ) -> impl Future<Output = Result<Vec<ManualEntry>, AppError>> + Send;
}
