use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifecycle of a discovered manual.
///
/// `Discovered → Downloading → {Downloaded | Failed}`. Only the download
/// orchestrator moves entries forward; an explicit requeue moves `Failed`
/// back to `Discovered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManualStatus {
    Discovered,
    Downloading,
    Downloaded,
    Failed,
}

impl ManualStatus {
    pub const ALL: [ManualStatus; 4] = [
        ManualStatus::Discovered,
        ManualStatus::Downloading,
        ManualStatus::Downloaded,
        ManualStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ManualStatus::Discovered => "discovered",
            ManualStatus::Downloading => "downloading",
            ManualStatus::Downloaded => "downloaded",
            ManualStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ManualStatus::Downloaded | ManualStatus::Failed)
    }
}

impl fmt::Display for ManualStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ManualStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "discovered" => Ok(ManualStatus::Discovered),
            "downloading" => Ok(ManualStatus::Downloading),
            "downloaded" => Ok(ManualStatus::Downloaded),
            "failed" => Ok(ManualStatus::Failed),
            _ => Err(format!("Unknown manual status: {}", s)),
        }
    }
}

/// A vehicle manual PDF found on the web.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualEntry {
    pub id: String,
    pub url: String,
    pub source_site: String,
    pub make: String,
    pub model: String,
    pub year: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trim: Option<String>,
    pub manual_type: String,
    pub language: String,
    pub file_size: i64,
    pub page_count: i32,
    pub discovered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    pub status: ManualStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ManualEntry {
    /// Creates a freshly discovered entry with its id derived from `url`.
    pub fn new(url: impl Into<String>, source_site: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: Self::id_for_url(&url),
            url,
            source_site: source_site.into(),
            make: String::new(),
            model: String::new(),
            year: 0,
            trim: None,
            manual_type: String::new(),
            language: "en".to_string(),
            file_size: 0,
            page_count: 0,
            discovered_at: Utc::now(),
            downloaded_at: None,
            local_path: None,
            status: ManualStatus::Discovered,
            error: None,
        }
    }

    pub fn with_vehicle(mut self, make: &str, model: &str, year: i32) -> Self {
        self.make = make.to_string();
        self.model = model.to_string();
        self.year = year;
        self
    }

    pub fn with_manual_type(mut self, manual_type: &str) -> Self {
        self.manual_type = manual_type.to_string();
        self
    }

    /// Deterministic id: hex of the first 16 bytes of SHA-256 over the URL.
    pub fn id_for_url(url: &str) -> String {
        let digest = Sha256::digest(url.as_bytes());
        hex_encode(&digest[..16])
    }

    /// Marks the entry downloaded at `local_path`, clearing any previous error.
    pub fn mark_downloaded(&mut self, local_path: impl Into<String>, file_size: i64) {
        self.local_path = Some(local_path.into());
        self.file_size = file_size;
        self.downloaded_at = Some(Utc::now());
        self.status = ManualStatus::Downloaded;
        self.error = None;
    }
}

/// A manual stored on local disk by a fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchedManual {
    pub local_path: String,
    pub size: i64,
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Aggregate counts over all registered manuals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_source: BTreeMap<String, u64>,
}

impl ManualStats {
    pub fn count(&self, status: ManualStatus) -> u64 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in ManualStatus::ALL {
            assert_eq!(status.as_str().parse::<ManualStatus>().unwrap(), status);
        }
        assert_eq!("FAILED".parse::<ManualStatus>().unwrap(), ManualStatus::Failed);
        assert!("ingested".parse::<ManualStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ManualStatus::Discovered.is_terminal());
        assert!(!ManualStatus::Downloading.is_terminal());
        assert!(ManualStatus::Downloaded.is_terminal());
        assert!(ManualStatus::Failed.is_terminal());
    }

    #[test]
    fn test_id_is_truncated_sha256_hex() {
        // sha256("abc") = ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad
        assert_eq!(
            ManualEntry::id_for_url("abc"),
            "ba7816bf8f01cfea414140de5dae2223"
        );
        let a = ManualEntry::new("https://example.com/a.pdf", "ford");
        let b = ManualEntry::new("https://example.com/a.pdf", "archive");
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 32);
    }

    #[test]
    fn test_serializes_status_lowercase_and_skips_empty_options() {
        let entry = ManualEntry::new("https://example.com/a.pdf", "ford")
            .with_vehicle("Ford", "F-150", 2021)
            .with_manual_type("owner");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["status"], "discovered");
        assert_eq!(json["year"], 2021);
        assert!(json.get("local_path").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_mark_downloaded_clears_error() {
        let mut entry = ManualEntry::new("https://example.com/a.pdf", "ford");
        entry.error = Some("HTTP 503".into());
        entry.mark_downloaded("/tmp/ford/f-150/2021/owner_abcd1234.pdf", 2048);
        assert_eq!(entry.status, ManualStatus::Downloaded);
        assert!(entry.downloaded_at.is_some());
        assert_eq!(entry.file_size, 2048);
        assert!(entry.error.is_none());
    }

    #[test]
    fn test_stats_count_defaults_to_zero() {
        let mut stats = ManualStats::default();
        stats.by_status.insert("failed".into(), 2);
        assert_eq!(stats.count(ManualStatus::Failed), 2);
        assert_eq!(stats.count(ManualStatus::Downloaded), 0);
    }
}
