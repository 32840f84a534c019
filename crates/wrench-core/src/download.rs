//! Concurrent download of discovered manuals.
//!
//! The orchestrator pulls a batch of `discovered` entries from the registry
//! and fetches them with at most `concurrency` downloads in flight. Each
//! entry is moved through its lifecycle in the registry:
//!
//! ```text
//! discovered --> downloading --+--> downloaded (local path attached)
//!                              +--> failed     (error text attached)
//! ```
//!
//! One entry failing never stops the rest of the batch. After each finished
//! entry its task sleeps for `pause` before giving up its slot, which bounds
//! sustained request rate independently of the concurrency limit.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::manual::{FetchedManual, ManualEntry, ManualStatus};
use crate::parallel::unwrap_join;
use crate::policy::ResiliencePolicy;
use crate::stage::{Stage, traced};
use crate::traits::{ManualFetcher, ManualRegistry};

/// Events emitted by the orchestrator for monitoring/logging.
#[derive(Debug, Clone)]
pub enum DownloadEvent<'a> {
    BatchStarted {
        run_id: Uuid,
        pending: usize,
    },
    ItemStarted {
        id: &'a str,
        url: &'a str,
    },
    ItemDownloaded {
        id: &'a str,
        local_path: &'a str,
        size: i64,
    },
    ItemFailed {
        id: &'a str,
        url: &'a str,
        error: &'a str,
    },
    StatusWriteFailed {
        id: &'a str,
        status: ManualStatus,
        error: &'a str,
    },
    Cancelled {
        run_id: Uuid,
        not_started: usize,
    },
    BatchFinished {
        report: &'a DownloadReport,
    },
}

/// Trait for receiving download events (decoupled logging).
pub trait DownloadReporter: Send + Sync {
    fn report(&self, event: DownloadEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDownloadReporter;

impl DownloadReporter for TracingDownloadReporter {
    fn report(&self, event: DownloadEvent<'_>) {
        match event {
            DownloadEvent::BatchStarted { run_id, pending } => {
                tracing::info!(%run_id, %pending, "Download batch started");
            }
            DownloadEvent::ItemStarted { id, url } => {
                tracing::debug!(%id, %url, "Downloading manual");
            }
            DownloadEvent::ItemDownloaded {
                id,
                local_path,
                size,
            } => {
                tracing::info!(%id, %local_path, %size, "Manual downloaded");
            }
            DownloadEvent::ItemFailed { id, url, error } => {
                tracing::warn!(%id, %url, %error, "Manual download failed");
            }
            DownloadEvent::StatusWriteFailed { id, status, error } => {
                tracing::error!(%id, %status, %error, "Failed to record manual status");
            }
            DownloadEvent::Cancelled {
                run_id,
                not_started,
            } => {
                tracing::info!(%run_id, %not_started, "Download batch cancelled");
            }
            DownloadEvent::BatchFinished { report } => {
                tracing::info!(
                    run_id = %report.run_id,
                    attempted = report.attempted,
                    downloaded = report.downloaded,
                    failed = report.failed,
                    skipped = report.skipped,
                    cancelled = report.cancelled,
                    "Download batch finished"
                );
            }
        }
    }
}

/// Configuration for a download run.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Maximum downloads in flight. `0` is treated as `1`.
    pub concurrency: usize,
    /// Batch size used when the caller passes a limit of `0`.
    pub batch_limit: usize,
    /// Pause after each finished entry, before its slot is released.
    pub pause: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            batch_limit: 100,
            pause: Duration::from_secs(1),
        }
    }
}

/// Outcome counts for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    pub run_id: Uuid,
    /// Entries whose fetch was started.
    pub attempted: usize,
    pub downloaded: usize,
    pub failed: usize,
    /// Entries whose status could not be recorded. Those rejected before the
    /// fetch are not counted as attempted.
    pub skipped: usize,
    /// Entries never started, or interrupted, because the run was cancelled.
    pub cancelled: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Downloaded,
    Failed,
    Skipped,
    /// Fetched or failed, but no terminal status could be written.
    Unrecorded,
    Cancelled,
}

/// Adapts a [`ManualFetcher`] to the stage contract.
pub fn fetch_stage<F: ManualFetcher>(fetcher: F) -> Stage<ManualEntry, FetchedManual> {
    Stage::new(move |cancel: CancellationToken, entry: ManualEntry| {
        let fetcher = fetcher.clone();
        async move { fetcher.fetch(cancel, entry).await }
    })
}

pub struct DownloadOrchestrator<R: ManualRegistry> {
    registry: R,
    fetch: Stage<ManualEntry, FetchedManual>,
    config: DownloadConfig,
    reporter: Arc<dyn DownloadReporter>,
}

impl<R: ManualRegistry> DownloadOrchestrator<R> {
    /// Builds an orchestrator around an arbitrary fetch stage.
    pub fn new(registry: R, fetch: Stage<ManualEntry, FetchedManual>, config: DownloadConfig) -> Self {
        Self {
            registry,
            fetch,
            config,
            reporter: Arc::new(TracingDownloadReporter),
        }
    }

    /// Builds an orchestrator whose fetches are traced and guarded by `policy`.
    pub fn with_fetcher<F: ManualFetcher>(
        registry: R,
        fetcher: F,
        policy: &ResiliencePolicy,
        config: DownloadConfig,
    ) -> Self {
        let fetch = policy.wrap(traced("fetch_manual", fetch_stage(fetcher)));
        Self::new(registry, fetch, config)
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn DownloadReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Downloads up to `limit` discovered entries (`0` = the configured batch
    /// size).
    ///
    /// Per-entry failures are recorded on the entry and counted in the report;
    /// they are not an error here. Only failing to read the batch is. Once
    /// `cancel` fires no new downloads are started; those already running
    /// finish or observe the token themselves.
    pub async fn download(
        &self,
        cancel: &CancellationToken,
        limit: usize,
    ) -> Result<DownloadReport, AppError> {
        let limit = if limit == 0 { self.config.batch_limit } else { limit };
        let pending = self
            .registry
            .list_by_status(ManualStatus::Discovered, limit)
            .await?;

        let mut report = DownloadReport {
            run_id: Uuid::new_v4(),
            ..Default::default()
        };
        self.reporter.report(DownloadEvent::BatchStarted {
            run_id: report.run_id,
            pending: pending.len(),
        });

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let total = pending.len();
        let mut not_started = 0;

        for (index, entry) in pending.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    not_started = total - index;
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => unreachable!("download semaphore is never closed"),
                },
            };

            let item = ItemTask {
                registry: self.registry.clone(),
                fetch: self.fetch.clone(),
                reporter: Arc::clone(&self.reporter),
                cancel: cancel.clone(),
                pause: self.config.pause,
            };
            tasks.spawn(async move {
                let outcome = item.run(entry).await;
                drop(permit);
                outcome
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match unwrap_join(joined) {
                ItemOutcome::Downloaded => {
                    report.attempted += 1;
                    report.downloaded += 1;
                }
                ItemOutcome::Failed => {
                    report.attempted += 1;
                    report.failed += 1;
                }
                ItemOutcome::Skipped => report.skipped += 1,
                ItemOutcome::Unrecorded => {
                    report.attempted += 1;
                    report.skipped += 1;
                }
                ItemOutcome::Cancelled => {
                    report.attempted += 1;
                    report.cancelled += 1;
                }
            }
        }

        if not_started > 0 {
            report.cancelled += not_started;
            self.reporter.report(DownloadEvent::Cancelled {
                run_id: report.run_id,
                not_started,
            });
        }
        self.reporter
            .report(DownloadEvent::BatchFinished { report: &report });
        Ok(report)
    }
}

/// Everything one spawned download needs.
struct ItemTask<R> {
    registry: R,
    fetch: Stage<ManualEntry, FetchedManual>,
    reporter: Arc<dyn DownloadReporter>,
    cancel: CancellationToken,
    pause: Duration,
}

impl<R: ManualRegistry> ItemTask<R> {
    async fn run(self, entry: ManualEntry) -> ItemOutcome {
        if !self.set_status(&entry.id, ManualStatus::Downloading, None).await {
            return ItemOutcome::Skipped;
        }
        self.reporter.report(DownloadEvent::ItemStarted {
            id: &entry.id,
            url: &entry.url,
        });

        let outcome = match self.fetch.run(self.cancel.clone(), entry.clone()).await {
            Ok(fetched) => self.record_success(entry, fetched).await,
            Err(e) if e.is_cancelled() => {
                // Interrupted, not failed: make it eligible for the next run.
                self.set_status(&entry.id, ManualStatus::Discovered, None).await;
                return ItemOutcome::Cancelled;
            }
            Err(e) => {
                let error = e.to_string();
                self.reporter.report(DownloadEvent::ItemFailed {
                    id: &entry.id,
                    url: &entry.url,
                    error: &error,
                });
                if self
                    .set_status(&entry.id, ManualStatus::Failed, Some(&error))
                    .await
                {
                    ItemOutcome::Failed
                } else {
                    ItemOutcome::Unrecorded
                }
            }
        };

        if !self.pause.is_zero() {
            tokio::select! {
                () = self.cancel.cancelled() => {}
                () = tokio::time::sleep(self.pause) => {}
            }
        }
        outcome
    }

    async fn record_success(&self, mut entry: ManualEntry, fetched: FetchedManual) -> ItemOutcome {
        entry.mark_downloaded(&fetched.local_path, fetched.size);
        if let Err(e) = self.registry.save(&entry).await {
            let error = e.to_string();
            self.reporter.report(DownloadEvent::StatusWriteFailed {
                id: &entry.id,
                status: ManualStatus::Downloaded,
                error: &error,
            });
            // Nothing re-lists `downloading`; park it as failed for requeue.
            let reason = format!("status write failed: {error}");
            return if self
                .set_status(&entry.id, ManualStatus::Failed, Some(&reason))
                .await
            {
                ItemOutcome::Failed
            } else {
                ItemOutcome::Unrecorded
            };
        }
        self.reporter.report(DownloadEvent::ItemDownloaded {
            id: &entry.id,
            local_path: &fetched.local_path,
            size: fetched.size,
        });
        ItemOutcome::Downloaded
    }

    /// Writes a status, reporting (not propagating) a registry failure.
    async fn set_status(&self, id: &str, status: ManualStatus, error: Option<&str>) -> bool {
        match self.registry.update_status(id, status, error).await {
            Ok(()) => true,
            Err(e) => {
                self.reporter.report(DownloadEvent::StatusWriteFailed {
                    id,
                    status,
                    error: &e.to_string(),
                });
                false
            }
        }
    }
}
