use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wrench_core::download::{DownloadConfig, DownloadOrchestrator};
use wrench_core::error::AppError;
use wrench_core::manual::{FetchedManual, ManualEntry, ManualStatus};
use wrench_core::policy::ResiliencePolicy;
use wrench_core::retry::RetryOpts;
use wrench_core::traits::{ManualFetcher, ManualRegistry};
use wrench_db::{Database, ManualRepository};

use crate::integration::common::setup_test_db;

fn test_entry(n: u32, source: &str) -> ManualEntry {
    ManualEntry::new(format!("https://{source}.example/manuals/{n}.pdf"), source)
        .with_vehicle("Toyota", "Corolla", 2019 + n as i32)
        .with_manual_type("owner")
}

#[derive(Clone)]
struct FailingOn(&'static str);

impl ManualFetcher for FailingOn {
    async fn fetch(
        &self,
        _cancel: CancellationToken,
        entry: ManualEntry,
    ) -> Result<FetchedManual, AppError> {
        if entry.url.contains(self.0) {
            return Err(AppError::HttpError("HTTP 404".into()));
        }
        Ok(FetchedManual {
            local_path: format!("/data/{}.pdf", entry.id),
            size: 2048,
        })
    }
}

#[tokio::test]
async fn save_and_get_round_trip() {
    let (pool, _container) = setup_test_db().await;
    let repo = ManualRepository::new(pool);

    let mut entry = test_entry(1, "toyota");
    entry.trim = Some("LE".into());
    repo.save(&entry).await.unwrap();

    let got = repo.get(&entry.id).await.unwrap().expect("entry exists");
    assert_eq!(got.url, entry.url);
    assert_eq!(got.make, "Toyota");
    assert_eq!(got.year, 2020);
    assert_eq!(got.trim.as_deref(), Some("LE"));
    assert_eq!(got.status, ManualStatus::Discovered);
    assert!(got.downloaded_at.is_none());

    assert!(repo.get("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn save_twice_updates_in_place() {
    let (pool, _container) = setup_test_db().await;
    let repo = ManualRepository::new(pool);

    let mut entry = test_entry(1, "toyota");
    repo.save(&entry).await.unwrap();
    entry.mark_downloaded("/data/toyota/1.pdf", 4096);
    repo.save(&entry).await.unwrap();

    let got = repo.get(&entry.id).await.unwrap().unwrap();
    assert_eq!(got.status, ManualStatus::Downloaded);
    assert_eq!(got.file_size, 4096);
    assert_eq!(got.local_path.as_deref(), Some("/data/toyota/1.pdf"));
    assert!(got.downloaded_at.is_some());
    assert_eq!(repo.stats().await.unwrap().total, 1);
}

#[tokio::test]
async fn list_by_status_oldest_first_with_limit() {
    let (pool, _container) = setup_test_db().await;
    let repo = ManualRepository::new(pool);

    let mut ids = Vec::new();
    for n in 0..4 {
        let mut entry = test_entry(n, "toyota");
        entry.discovered_at = chrono::Utc::now() - chrono::Duration::minutes(10 - n as i64);
        repo.save(&entry).await.unwrap();
        ids.push(entry.id);
    }
    repo.update_status(&ids[0], ManualStatus::Failed, Some("HTTP 500"))
        .await
        .unwrap();

    let pending = repo.list_by_status(ManualStatus::Discovered, 2).await.unwrap();
    let got: Vec<&str> = pending.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(got, vec![ids[1].as_str(), ids[2].as_str()]);
}

#[tokio::test]
async fn update_status_records_and_clears_error() {
    let (pool, _container) = setup_test_db().await;
    let repo = ManualRepository::new(pool);
    let entry = test_entry(1, "toyota");
    repo.save(&entry).await.unwrap();

    repo.update_status(&entry.id, ManualStatus::Failed, Some("timeout"))
        .await
        .unwrap();
    let got = repo.get(&entry.id).await.unwrap().unwrap();
    assert_eq!(got.status, ManualStatus::Failed);
    assert_eq!(got.error.as_deref(), Some("timeout"));

    repo.update_status(&entry.id, ManualStatus::Downloading, None)
        .await
        .unwrap();
    let got = repo.get(&entry.id).await.unwrap().unwrap();
    assert!(got.error.is_none());
}

#[tokio::test]
async fn update_status_unknown_id_is_not_found() {
    let (pool, _container) = setup_test_db().await;
    let repo = ManualRepository::new(pool);

    let err = repo
        .update_status("deadbeef", ManualStatus::Failed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn stats_group_by_status_and_source() {
    let (pool, _container) = setup_test_db().await;
    let repo = ManualRepository::new(pool);

    for n in 0..3 {
        repo.save(&test_entry(n, "toyota")).await.unwrap();
    }
    let archived = test_entry(9, "archive");
    repo.save(&archived).await.unwrap();
    repo.update_status(&archived.id, ManualStatus::Failed, Some("HTTP 403"))
        .await
        .unwrap();

    let stats = repo.stats().await.unwrap();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.count(ManualStatus::Discovered), 3);
    assert_eq!(stats.count(ManualStatus::Failed), 1);
    assert_eq!(stats.by_source["toyota"], 3);
    assert_eq!(stats.by_source["archive"], 1);
}

#[tokio::test]
async fn requeue_failed_respects_limit() {
    let (pool, _container) = setup_test_db().await;
    let repo = ManualRepository::new(pool);

    for n in 0..3 {
        let entry = test_entry(n, "toyota");
        repo.save(&entry).await.unwrap();
        repo.update_status(&entry.id, ManualStatus::Failed, Some("HTTP 503"))
            .await
            .unwrap();
    }

    assert_eq!(repo.requeue_failed(2).await.unwrap(), 2);
    let stats = repo.stats().await.unwrap();
    assert_eq!(stats.count(ManualStatus::Discovered), 2);
    assert_eq!(stats.count(ManualStatus::Failed), 1);

    let requeued = repo.list_by_status(ManualStatus::Discovered, 10).await.unwrap();
    assert!(requeued.iter().all(|e| e.error.is_none()));
}

#[tokio::test]
async fn list_by_make_is_case_insensitive() {
    let (pool, _container) = setup_test_db().await;
    let repo = ManualRepository::new(pool);

    for n in 0..3 {
        repo.save(&test_entry(n, "toyota")).await.unwrap();
    }
    let kia =
        ManualEntry::new("https://kia.example/niro.pdf", "kia").with_vehicle("Kia", "Niro", 2021);
    repo.save(&kia).await.unwrap();

    let toyotas = repo.list_by_make("TOYOTA", 10).await.unwrap();
    assert_eq!(toyotas.len(), 3);
    assert_eq!(toyotas[0].year, 2021);
}

#[tokio::test]
async fn download_batch_against_postgres() {
    let (pool, _container) = setup_test_db().await;
    let db = Database::from_pool(pool);
    db.manual_repo().health_check().await.unwrap();
    let repo = db.manual_repo();

    for n in 0..4 {
        repo.save(&test_entry(n, "toyota")).await.unwrap();
    }

    let orchestrator = DownloadOrchestrator::with_fetcher(
        repo.clone(),
        FailingOn("/2.pdf"),
        &ResiliencePolicy::new(RetryOpts::new(1, Duration::ZERO, Duration::ZERO)),
        DownloadConfig {
            concurrency: 2,
            batch_limit: 10,
            pause: Duration::ZERO,
        },
    );
    let report = orchestrator
        .download(&CancellationToken::new(), 0)
        .await
        .unwrap();

    assert_eq!(report.downloaded, 3);
    assert_eq!(report.failed, 1);

    let stats = repo.stats().await.unwrap();
    assert_eq!(stats.count(ManualStatus::Downloaded), 3);
    assert_eq!(stats.count(ManualStatus::Failed), 1);
    let failed = repo.list_by_status(ManualStatus::Failed, 10).await.unwrap();
    assert!(failed[0].error.as_deref().unwrap_or_default().contains("404"));
}
