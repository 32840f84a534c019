use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use wrench_core::AppError;

use crate::manual_repository::ManualRepository;

/// The manual registry's PostgreSQL handle.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connects to `url` with a pool of `max_connections` and applies any
    /// pending migrations.
    pub async fn open(url: &str, max_connections: u32) -> Result<Self, AppError> {
        if max_connections == 0 {
            return Err(AppError::ConfigError(
                "database pool needs at least one connection".into(),
            ));
        }
        let options: PgConnectOptions = url
            .parse()
            .map_err(|e| AppError::ConfigError(format!("Invalid database URL: {e}")))?;
        let (host, port) = (options.get_host().to_string(), options.get_port());

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect to {host}:{port}: {e}")))?;

        let db = Self { pool };
        db.migrate().await?;
        tracing::debug!(%host, port, max_connections, "Manual registry ready");
        Ok(db)
    }

    /// Wraps an existing pool without migrating it.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    pub fn manual_repo(&self) -> ManualRepository {
        ManualRepository::new(self.pool.clone())
    }
}
