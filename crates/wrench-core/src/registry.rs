//! In-process [`ManualRegistry`].
//!
//! Entries are kept in insertion order, which doubles as discovery order for
//! [`list_by_status`](ManualRegistry::list_by_status). Useful for tests and
//! for dry runs that should not touch the database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::AppError;
use crate::manual::{ManualEntry, ManualStats, ManualStatus};
use crate::traits::ManualRegistry;

#[derive(Debug, Default)]
struct Entries {
    order: Vec<String>,
    by_id: HashMap<String, ManualEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    inner: Arc<Mutex<Entries>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry pre-populated with `entries`.
    pub fn with_entries(entries: impl IntoIterator<Item = ManualEntry>) -> Self {
        let registry = Self::new();
        {
            let mut inner = registry.lock_inner();
            for entry in entries {
                upsert(&mut inner, entry);
            }
        }
        registry
    }

    /// Snapshot of all entries in insertion order.
    pub fn entries(&self) -> Vec<ManualEntry> {
        let inner = self.lock_inner();
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned registry mutex");
            poisoned.into_inner()
        })
    }
}

fn upsert(inner: &mut Entries, entry: ManualEntry) {
    if !inner.by_id.contains_key(&entry.id) {
        inner.order.push(entry.id.clone());
    }
    inner.by_id.insert(entry.id.clone(), entry);
}

impl ManualRegistry for MemoryRegistry {
    async fn list_by_status(
        &self,
        status: ManualStatus,
        limit: usize,
    ) -> Result<Vec<ManualEntry>, AppError> {
        let inner = self.lock_inner();
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id))
            .filter(|e| e.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        id: &str,
        status: ManualStatus,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        let mut inner = self.lock_inner();
        let entry = inner
            .by_id
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(id.to_string()))?;
        entry.status = status;
        entry.error = error.map(str::to_string);
        Ok(())
    }

    async fn save(&self, entry: &ManualEntry) -> Result<(), AppError> {
        upsert(&mut self.lock_inner(), entry.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ManualEntry>, AppError> {
        Ok(self.lock_inner().by_id.get(id).cloned())
    }

    async fn stats(&self) -> Result<ManualStats, AppError> {
        let inner = self.lock_inner();
        let mut stats = ManualStats::default();
        for entry in inner.by_id.values() {
            stats.total += 1;
            *stats
                .by_status
                .entry(entry.status.as_str().to_string())
                .or_default() += 1;
            *stats.by_source.entry(entry.source_site.clone()).or_default() += 1;
        }
        Ok(stats)
    }

    async fn requeue_failed(&self, limit: usize) -> Result<u64, AppError> {
        let mut inner = self.lock_inner();
        let failed: Vec<String> = inner
            .order
            .iter()
            .filter(|id| {
                inner
                    .by_id
                    .get(*id)
                    .is_some_and(|e| e.status == ManualStatus::Failed)
            })
            .take(limit)
            .cloned()
            .collect();

        for id in &failed {
            if let Some(entry) = inner.by_id.get_mut(id) {
                entry.status = ManualStatus::Discovered;
                entry.error = None;
            }
        }
        Ok(failed.len() as u64)
    }
}
