use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};

use wrench_core::error::AppError;
use wrench_core::manual::{ManualEntry, ManualStats, ManualStatus};
use wrench_core::traits::ManualRegistry;

const COLUMNS: &str = "id, url, source_site, make, model, year, trim_level, manual_type, \
     language, file_size, page_count, discovered_at, downloaded_at, local_path, status, error";

/// PostgreSQL-backed manual registry.
#[derive(Clone)]
pub struct ManualRepository {
    pool: Pool<Postgres>,
}

impl ManualRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Checks that the database answers a trivial query.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    /// Entries for one vehicle make, newest model year first.
    pub async fn list_by_make(
        &self,
        make: &str,
        limit: usize,
    ) -> Result<Vec<ManualEntry>, AppError> {
        let rows = sqlx::query_as::<_, ManualEntryRow>(&format!(
            "SELECT {COLUMNS} FROM manual_entries
             WHERE LOWER(make) = LOWER($1)
             ORDER BY year DESC, model, id
             LIMIT $2"
        ))
        .bind(make)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct ManualEntryRow {
    id: String,
    url: String,
    source_site: String,
    make: String,
    model: String,
    year: i32,
    trim_level: Option<String>,
    manual_type: String,
    language: String,
    file_size: i64,
    page_count: i32,
    discovered_at: DateTime<Utc>,
    downloaded_at: Option<DateTime<Utc>>,
    local_path: Option<String>,
    status: String,
    error: Option<String>,
}

impl From<ManualEntryRow> for ManualEntry {
    fn from(row: ManualEntryRow) -> Self {
        ManualEntry {
            id: row.id,
            url: row.url,
            source_site: row.source_site,
            make: row.make,
            model: row.model,
            year: row.year,
            trim: row.trim_level,
            manual_type: row.manual_type,
            language: row.language,
            file_size: row.file_size,
            page_count: row.page_count,
            discovered_at: row.discovered_at,
            downloaded_at: row.downloaded_at,
            local_path: row.local_path,
            status: row.status.parse().unwrap_or(ManualStatus::Discovered),
            error: row.error,
        }
    }
}

impl ManualRegistry for ManualRepository {
    async fn list_by_status(
        &self,
        status: ManualStatus,
        limit: usize,
    ) -> Result<Vec<ManualEntry>, AppError> {
        let rows = sqlx::query_as::<_, ManualEntryRow>(&format!(
            "SELECT {COLUMNS} FROM manual_entries
             WHERE status = $1
             ORDER BY discovered_at, id
             LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update_status(
        &self,
        id: &str,
        status: ManualStatus,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE manual_entries
            SET status = $2, error = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn save(&self, entry: &ManualEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO manual_entries (
                id, url, source_site, make, model, year, trim_level, manual_type,
                language, file_size, page_count, discovered_at, downloaded_at,
                local_path, status, error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (id) DO UPDATE SET
                url = EXCLUDED.url,
                source_site = EXCLUDED.source_site,
                make = EXCLUDED.make,
                model = EXCLUDED.model,
                year = EXCLUDED.year,
                trim_level = EXCLUDED.trim_level,
                manual_type = EXCLUDED.manual_type,
                language = EXCLUDED.language,
                file_size = EXCLUDED.file_size,
                page_count = EXCLUDED.page_count,
                downloaded_at = EXCLUDED.downloaded_at,
                local_path = EXCLUDED.local_path,
                status = EXCLUDED.status,
                error = EXCLUDED.error,
                updated_at = NOW()
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.url)
        .bind(&entry.source_site)
        .bind(&entry.make)
        .bind(&entry.model)
        .bind(entry.year)
        .bind(&entry.trim)
        .bind(&entry.manual_type)
        .bind(&entry.language)
        .bind(entry.file_size)
        .bind(entry.page_count)
        .bind(entry.discovered_at)
        .bind(entry.downloaded_at)
        .bind(&entry.local_path)
        .bind(entry.status.as_str())
        .bind(&entry.error)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ManualEntry>, AppError> {
        let row = sqlx::query_as::<_, ManualEntryRow>(&format!(
            "SELECT {COLUMNS} FROM manual_entries WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn stats(&self) -> Result<ManualStats, AppError> {
        let by_status = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM manual_entries GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let by_source = sqlx::query_as::<_, (String, i64)>(
            "SELECT source_site, COUNT(*) FROM manual_entries GROUP BY source_site",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let mut stats = ManualStats::default();
        for (status, count) in by_status {
            let count = count.max(0) as u64;
            stats.total += count;
            stats.by_status.insert(status, count);
        }
        for (source, count) in by_source {
            stats.by_source.insert(source, count.max(0) as u64);
        }
        Ok(stats)
    }

    async fn requeue_failed(&self, limit: usize) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE manual_entries
            SET status = 'discovered', error = NULL, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM manual_entries
                WHERE status = 'failed'
                ORDER BY discovered_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(sql_limit(limit))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            tracing::info!(requeued, "Requeued failed manuals");
        }
        Ok(requeued)
    }
}
