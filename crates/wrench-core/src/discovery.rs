//! Registering discovered manuals.
//!
//! Sources are queried one after another. A source that errors is logged and
//! skipped so one broken website never blocks the rest of the index.

use std::path::PathBuf;

use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::manual::{ManualEntry, ManualStatus};
use crate::traits::{ManualRegistry, ManualSource};

/// Makes queried when no explicit list is configured.
pub const KNOWN_MAKES: &[&str] = &[
    "acura",
    "audi",
    "bmw",
    "cadillac",
    "dodge",
    "ford",
    "genesis",
    "honda",
    "hyundai",
    "infiniti",
    "jeep",
    "kia",
    "mercedes",
    "mitsubishi",
    "nissan",
    "porsche",
    "subaru",
    "toyota",
    "volkswagen",
    "volvo",
];

const DEFAULT_YEARS: (i32, i32) = (2015, 2026);

#[derive(Debug, Clone, Default)]
pub struct DiscoveryConfig {
    /// Makes to query. Empty means [`KNOWN_MAKES`].
    pub makes: Vec<String>,
    /// Inclusive year range; a zero bound selects the default range.
    pub years: (i32, i32),
    /// Maximum entries kept per source. `0` keeps everything.
    pub max_per_source: usize,
}

impl DiscoveryConfig {
    fn makes(&self) -> Vec<String> {
        if self.makes.is_empty() {
            KNOWN_MAKES.iter().map(|m| m.to_string()).collect()
        } else {
            self.makes.clone()
        }
    }
}

/// Inclusive list of years from `from` to `to`. If either bound is zero the
/// default 2015 to 2026 range is used.
pub fn year_range(from: i32, to: i32) -> Vec<i32> {
    let (from, to) = if from == 0 || to == 0 {
        DEFAULT_YEARS
    } else {
        (from, to)
    };
    (from..=to).collect()
}

/// Queries every source and saves what it finds.
///
/// Missing ids are derived from the URL and every new entry is saved as
/// `discovered`. Entries already in the registry are left untouched. Returns
/// the number of new entries saved. Stops between sources once `cancel`
/// fires and returns [`AppError::Cancelled`].
pub async fn register_discovered<R, S>(
    cancel: &CancellationToken,
    registry: &R,
    sources: &[S],
    config: &DiscoveryConfig,
) -> Result<usize, AppError>
where
    R: ManualRegistry,
    S: ManualSource,
{
    let makes = config.makes();
    let years = year_range(config.years.0, config.years.1);
    let mut total = 0;

    for source in sources {
        if cancel.is_cancelled() {
            return Err(AppError::cancelled());
        }

        tracing::info!(source = source.name(), "Discovering manuals");
        let mut entries = match source.discover(cancel, &makes, &years).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(source = source.name(), error = %e, "Discovery failed, skipping source");
                continue;
            }
        };

        if config.max_per_source > 0 {
            entries.truncate(config.max_per_source);
        }

        let found = entries.len();
        let mut saved = 0;
        let mut known = 0;
        for mut entry in entries {
            if entry.id.is_empty() {
                entry.id = ManualEntry::id_for_url(&entry.url);
            }
            // Rediscovery never resets an entry's progress.
            match registry.get(&entry.id).await {
                Ok(Some(_)) => {
                    known += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(url = %entry.url, error = %e, "Failed to look up entry");
                    continue;
                }
            }
            entry.status = ManualStatus::Discovered;
            entry.error = None;
            match registry.save(&entry).await {
                Ok(()) => saved += 1,
                Err(e) => tracing::warn!(url = %entry.url, error = %e, "Failed to save entry"),
            }
        }

        tracing::info!(source = source.name(), found, saved, known, "Discovery finished");
        total += saved;
    }
    Ok(total)
}

/// One line of a seed file.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedRecord {
    pub url: String,
    pub make: String,
    pub model: String,
    pub year: i32,
    #[serde(default)]
    pub trim: Option<String>,
    #[serde(default)]
    pub manual_type: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

impl SeedRecord {
    fn into_entry(self, source_site: &str) -> ManualEntry {
        let mut entry = ManualEntry::new(self.url, source_site)
            .with_vehicle(&self.make, &self.model, self.year)
            .with_manual_type(self.manual_type.as_deref().unwrap_or("owner"));
        entry.trim = self.trim;
        if let Some(language) = self.language {
            entry.language = language;
        }
        entry.discovered_at = Utc::now();
        entry
    }
}

/// A [`ManualSource`] backed by a JSON-lines file of [`SeedRecord`]s.
///
/// Records are filtered by make (case-insensitive) and year. Blank lines are
/// skipped; a malformed line fails the whole source.
#[derive(Debug, Clone)]
pub struct SeedFileSource {
    name: String,
    path: PathBuf,
}

impl SeedFileSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

impl ManualSource for SeedFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(
        &self,
        _cancel: &CancellationToken,
        makes: &[String],
        years: &[i32],
    ) -> Result<Vec<ManualEntry>, AppError> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let mut entries = Vec::new();
        for (n, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: SeedRecord = serde_json::from_str(line).map_err(|e| {
                AppError::generic(format!("{}:{}: {e}", self.path.display(), n + 1))
            })?;
            let wanted_make = makes.iter().any(|m| m.eq_ignore_ascii_case(&record.make));
            if wanted_make && years.contains(&record.year) {
                entries.push(record.into_entry(&self.name));
            }
        }
        Ok(entries)
    }
}
