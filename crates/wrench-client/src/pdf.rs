use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use url::Url;
use wrench_core::error::AppError;
use wrench_core::manual::{FetchedManual, ManualEntry};
use wrench_core::traits::ManualFetcher;

const DEFAULT_USER_AGENT: &str = "Wrench/0.3 (manual downloader)";
const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Settings for [`PdfDownloader`].
#[derive(Debug, Clone)]
pub struct PdfDownloaderConfig {
    pub output_dir: PathBuf,
    /// Largest accepted file in bytes. `0` disables the check.
    pub max_file_size: u64,
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for PdfDownloaderConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("manuals"),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Downloads manual PDFs into `{output_dir}/{make}/{model}/{year}/`.
///
/// Partial downloads are kept next to the target as `*.pdf.tmp` and resumed
/// with a `Range` request on the next attempt. A file is only moved into
/// place once it starts with the `%PDF` magic bytes.
#[derive(Clone)]
pub struct PdfDownloader {
    client: Client,
    output_dir: PathBuf,
    max_file_size: u64,
    timeout_secs: u64,
}

impl PdfDownloader {
    pub fn new(config: PdfDownloaderConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            output_dir: config.output_dir,
            max_file_size: config.max_file_size,
            timeout_secs: config.timeout.as_secs(),
        })
    }

    /// Where `entry` is stored once downloaded.
    pub fn target_path(&self, entry: &ManualEntry) -> PathBuf {
        let manual_type = match entry.manual_type.as_str() {
            "" => "owner".to_string(),
            t => sanitize_segment(t),
        };
        let id = if entry.id.is_empty() {
            ManualEntry::id_for_url(&entry.url)
        } else {
            entry.id.clone()
        };
        let short_id = id.get(..8).unwrap_or(&id);

        self.output_dir
            .join(sanitize_segment(&entry.make))
            .join(sanitize_segment(&entry.model))
            .join(entry.year.to_string())
            .join(format!("{manual_type}_{short_id}.pdf"))
    }

    async fn download(&self, entry: &ManualEntry) -> Result<FetchedManual, AppError> {
        validate_url(&entry.url)?;

        let local_path = self.target_path(entry);
        if let Some(dir) = local_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        if let Ok(meta) = tokio::fs::metadata(&local_path).await
            && meta.is_file()
        {
            tracing::debug!(path = %local_path.display(), "Manual already on disk");
            return Ok(fetched(&local_path, meta.len()));
        }

        let tmp_path = tmp_path_for(&local_path);
        let existing = tokio::fs::metadata(&tmp_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let mut request = self.client.get(&entry.url);
        if existing > 0 {
            tracing::debug!(url = %entry.url, existing, "Resuming partial download");
            request = request.header(RANGE, format!("bytes={existing}-"));
        }

        let mut response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_secs)
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::HttpError(e.to_string())
            }
        })?;

        let status = response.status();
        let resumed = status == StatusCode::PARTIAL_CONTENT;
        if status != StatusCode::OK && !resumed {
            return Err(AppError::HttpError(format!(
                "HTTP {} for {}",
                status.as_u16(),
                entry.url
            )));
        }

        if self.max_file_size > 0
            && let Some(len) = response.content_length()
            && len > self.max_file_size
        {
            return Err(AppError::InvalidDocument(format!(
                "file too large: {len} bytes"
            )));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(resumed)
            .truncate(!resumed)
            .open(&tmp_path)
            .await?;

        let mut written = if resumed { existing } else { 0 };
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))?
        {
            written += chunk.len() as u64;
            if self.max_file_size > 0 && written > self.max_file_size {
                drop(file);
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(AppError::InvalidDocument(format!(
                    "file too large: more than {} bytes",
                    self.max_file_size
                )));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        if let Err(e) = verify_pdf(&tmp_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        tokio::fs::rename(&tmp_path, &local_path).await?;

        tracing::debug!(path = %local_path.display(), bytes = written, "Manual saved");
        Ok(fetched(&local_path, written))
    }
}

impl ManualFetcher for PdfDownloader {
    async fn fetch(
        &self,
        cancel: CancellationToken,
        entry: ManualEntry,
    ) -> Result<FetchedManual, AppError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AppError::cancelled()),
            result = self.download(&entry) => result,
        }
    }
}

fn fetched(path: &Path, size: u64) -> FetchedManual {
    FetchedManual {
        local_path: path.display().to_string(),
        size: i64::try_from(size).unwrap_or(i64::MAX),
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Lowercases and keeps `[a-z0-9_-]`; spaces and slashes become `_`.
pub fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '/' { '_' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::HttpError(format!("Invalid URL: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(AppError::HttpError(format!(
            "URL scheme '{scheme}' is not allowed (only http/https)"
        ))),
    }
}

async fn verify_pdf(path: &Path) -> Result<(), AppError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut header = [0u8; 4];
    let mut read = 0;
    while read < header.len() {
        let n = file.read(&mut header[read..]).await?;
        if n == 0 {
            break;
        }
        read += n;
    }
    if read < header.len() {
        return Err(AppError::InvalidDocument("cannot read PDF header".into()));
    }
    if &header != b"%PDF" {
        return Err(AppError::InvalidDocument("not a valid PDF file".into()));
    }
    Ok(())
}
