use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// SQL migration statements, executed one at a time.
const MIGRATIONS: &[&str] = &[
    // 0001_manual_entries.sql
    r#"CREATE TABLE IF NOT EXISTS manual_entries (
        id VARCHAR(32) PRIMARY KEY,
        url VARCHAR NOT NULL,
        source_site VARCHAR(100) NOT NULL,
        make VARCHAR(100) NOT NULL DEFAULT '',
        model VARCHAR(100) NOT NULL DEFAULT '',
        year INTEGER NOT NULL DEFAULT 0,
        trim_level VARCHAR(100),
        manual_type VARCHAR(50) NOT NULL DEFAULT '',
        language VARCHAR(10) NOT NULL DEFAULT 'en',
        file_size BIGINT NOT NULL DEFAULT 0,
        page_count INTEGER NOT NULL DEFAULT 0,
        discovered_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        downloaded_at TIMESTAMPTZ,
        local_path VARCHAR,
        status VARCHAR(20) NOT NULL DEFAULT 'discovered',
        error TEXT,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT chk_manual_entries_status CHECK (
            status IN ('discovered', 'downloading', 'downloaded', 'failed')
        )
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_manual_entries_status ON manual_entries(status, discovered_at)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_manual_entries_source ON manual_entries(source_site)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_manual_entries_vehicle ON manual_entries(make, model, year)"#,
];

/// Spins up a PostgreSQL container and returns a connected pool.
///
/// Keep the returned `ContainerAsync` alive for the whole test; dropping it
/// stops the container.
pub async fn setup_test_db() -> (PgPool, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "wrench_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/wrench_test");

    // The server may still be starting even after the log line appears
    const MAX_RETRIES: u32 = 30;
    let mut retries = 0;
    let pool = loop {
        match PgPoolOptions::new()
            .max_connections(5)
            .connect(&connection_string)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retries += 1;
                if retries >= MAX_RETRIES {
                    panic!("Failed to connect to database after {MAX_RETRIES} retries: {e}");
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    };

    // Run migrations one statement at a time
    for migration in MIGRATIONS {
        sqlx::query(migration)
            .execute(&pool)
            .await
            .expect("Failed to run migration");
    }

    (pool, container)
}
