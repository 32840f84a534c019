//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` or atomics for interior mutability, allowing
//! test assertions on recorded calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::download::{DownloadEvent, DownloadReporter};
use crate::error::AppError;
use crate::manual::{FetchedManual, ManualEntry, ManualStats, ManualStatus};
use crate::registry::MemoryRegistry;
use crate::traits::{ManualFetcher, ManualRegistry, ManualSource};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher that "downloads" to `/data/{id}.pdf`.
///
/// Failures are configured by URL substring or by a number of leading calls.
/// Tracks call count and peak concurrency.
#[derive(Clone, Default)]
pub struct MockFetcher {
    fail_on: Option<(&'static str, fn() -> AppError)>,
    fail_first: Option<(usize, fn() -> AppError)>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, url_part: &'static str, error: fn() -> AppError) -> Self {
        self.fail_on = Some((url_part, error));
        self
    }

    pub fn failing_times(mut self, times: usize, error: fn() -> AppError) -> Self {
        self.fail_first = Some((times, error));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl ManualFetcher for MockFetcher {
    async fn fetch(
        &self,
        _cancel: CancellationToken,
        entry: ManualEntry,
    ) -> Result<FetchedManual, AppError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        if let Some((times, error)) = self.fail_first
            && call < times
        {
            return Err(error());
        }
        if let Some((url_part, error)) = self.fail_on
            && entry.url.contains(url_part)
        {
            return Err(error());
        }
        Ok(FetchedManual {
            local_path: format!("/data/{}.pdf", entry.id),
            size: 1024,
        })
    }
}

// ---------------------------------------------------------------------------
// MockSource
// ---------------------------------------------------------------------------

/// Mock source returning a canned result once; later calls find nothing.
pub struct MockSource {
    name: String,
    result: Mutex<Option<Result<Vec<ManualEntry>, AppError>>>,
    last_query: Mutex<Option<(Vec<String>, Vec<i32>)>>,
}

impl MockSource {
    pub fn new(name: &str, result: Result<Vec<ManualEntry>, AppError>) -> Self {
        Self {
            name: name.to_string(),
            result: Mutex::new(Some(result)),
            last_query: Mutex::new(None),
        }
    }

    /// Makes and years passed to the most recent `discover` call.
    pub fn last_query(&self) -> Option<(Vec<String>, Vec<i32>)> {
        self.last_query.lock().unwrap().clone()
    }
}

impl ManualSource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(
        &self,
        _cancel: &CancellationToken,
        makes: &[String],
        years: &[i32],
    ) -> Result<Vec<ManualEntry>, AppError> {
        *self.last_query.lock().unwrap() = Some((makes.to_vec(), years.to_vec()));
        self.result.lock().unwrap().take().unwrap_or(Ok(Vec::new()))
    }
}

// ---------------------------------------------------------------------------
// FlakyRegistry
// ---------------------------------------------------------------------------

/// Registry that rejects status writes to one particular status.
#[derive(Clone)]
pub struct FlakyRegistry {
    inner: MemoryRegistry,
    reject: ManualStatus,
}

impl FlakyRegistry {
    pub fn failing_on(inner: MemoryRegistry, reject: ManualStatus) -> Self {
        Self { inner, reject }
    }
}

impl ManualRegistry for FlakyRegistry {
    async fn list_by_status(
        &self,
        status: ManualStatus,
        limit: usize,
    ) -> Result<Vec<ManualEntry>, AppError> {
        self.inner.list_by_status(status, limit).await
    }

    async fn update_status(
        &self,
        id: &str,
        status: ManualStatus,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        if status == self.reject {
            return Err(AppError::DatabaseError("connection closed".into()));
        }
        self.inner.update_status(id, status, error).await
    }

    async fn save(&self, entry: &ManualEntry) -> Result<(), AppError> {
        if entry.status == self.reject {
            return Err(AppError::DatabaseError("connection closed".into()));
        }
        self.inner.save(entry).await
    }

    async fn get(&self, id: &str) -> Result<Option<ManualEntry>, AppError> {
        self.inner.get(id).await
    }

    async fn stats(&self) -> Result<ManualStats, AppError> {
        self.inner.stats().await
    }

    async fn requeue_failed(&self, limit: usize) -> Result<u64, AppError> {
        self.inner.requeue_failed(limit).await
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Reporter that records the name of every event it receives.
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == name).count()
    }
}

impl DownloadReporter for RecordingReporter {
    fn report(&self, event: DownloadEvent<'_>) {
        let name = match event {
            DownloadEvent::BatchStarted { .. } => "batch_started",
            DownloadEvent::ItemStarted { .. } => "item_started",
            DownloadEvent::ItemDownloaded { .. } => "item_downloaded",
            DownloadEvent::ItemFailed { .. } => "item_failed",
            DownloadEvent::StatusWriteFailed { .. } => "status_write_failed",
            DownloadEvent::Cancelled { .. } => "cancelled",
            DownloadEvent::BatchFinished { .. } => "batch_finished",
        };
        self.events.lock().unwrap().push(name.to_string());
    }
}
