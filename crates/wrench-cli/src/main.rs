use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use wrench_client::{PdfDownloader, PdfDownloaderConfig};
use wrench_core::discovery::{DiscoveryConfig, SeedFileSource, register_discovered};
use wrench_core::{
    CircuitBreaker, CircuitBreakerConfig, DownloadConfig, DownloadOrchestrator, ManualRegistry,
    ManualStatus, RateLimiter, RateLimiterConfig, ResiliencePolicy, RetryOpts,
};
use wrench_db::{Database, ManualRepository};

#[derive(Parser)]
#[command(name = "wrench", version, about = "Vehicle manual crawler")]
struct Cli {
    /// PostgreSQL connection string for the manual registry
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Pool size for registry connections
    #[arg(
        long,
        env = "DATABASE_MAX_CONNECTIONS",
        global = true,
        default_value_t = 5,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    db_max_connections: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register manuals listed in a JSON-lines seed file
    Discover {
        /// Seed file with one `{"url", "make", "model", "year"}` object per line
        #[arg(short, long)]
        seed: PathBuf,

        /// Source name recorded on every entry
        #[arg(long, default_value = "seed")]
        source: String,

        /// Makes to keep (comma separated). Defaults to every known make
        #[arg(long, value_delimiter = ',')]
        makes: Vec<String>,

        /// First model year (0 = default range)
        #[arg(long, default_value_t = 0)]
        year_from: i32,

        /// Last model year (0 = default range)
        #[arg(long, default_value_t = 0)]
        year_to: i32,

        /// Keep at most this many entries per source (0 = no cap)
        #[arg(long, default_value_t = 0)]
        max_per_source: usize,
    },

    /// Download discovered manuals
    Download(DownloadArgs),

    /// Move failed manuals back to discovered
    Requeue {
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },

    /// Show counts by status and source
    Stats,

    /// List manuals with a given status
    List {
        #[arg(short, long, default_value = "discovered")]
        status: ManualStatus,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Only show this make (case-insensitive); ignores --status
        #[arg(long)]
        make: Option<String>,
    },
}

#[derive(Args)]
struct DownloadArgs {
    /// Manuals to attempt in this run (0 = batch default of 100)
    #[arg(short, long, default_value_t = 0)]
    limit: usize,

    /// Concurrent downloads
    #[arg(short, long, env = "WRENCH_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Pause after each manual, in milliseconds
    #[arg(long, env = "WRENCH_PAUSE_MS", default_value_t = 1000)]
    pause_ms: u64,

    /// Directory manuals are written to
    #[arg(short, long, env = "WRENCH_OUTPUT_DIR", default_value = "manuals")]
    output_dir: PathBuf,

    /// Largest accepted PDF in MiB (0 = unlimited)
    #[arg(long, default_value_t = 100)]
    max_size_mb: u64,

    /// User-Agent header sent with every request
    #[arg(long, env = "WRENCH_USER_AGENT", default_value = "Wrench/0.3 (manual downloader)")]
    user_agent: String,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Attempts per manual, including the first
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// First retry wait in milliseconds; doubles per attempt
    #[arg(long, default_value_t = 1000)]
    retry_wait_ms: u64,

    /// Requests per second across all workers (0 = no limiter)
    #[arg(long, default_value_t = 0.0)]
    rate: f64,

    /// Requests allowed in a burst when --rate is set
    #[arg(long, default_value_t = 1)]
    burst: u32,

    /// Consecutive failures that open the circuit (0 = no breaker)
    #[arg(long, default_value_t = 5)]
    breaker_threshold: u32,

    /// Seconds the circuit stays open before a probe
    #[arg(long, default_value_t = 30)]
    breaker_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("wrench=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    let repo = connect_db(cli.database_url.as_deref(), cli.db_max_connections).await?;

    match cli.command {
        Commands::Discover {
            seed,
            source,
            makes,
            year_from,
            year_to,
            max_per_source,
        } => {
            let config = DiscoveryConfig {
                makes,
                years: (year_from, year_to),
                max_per_source,
            };
            let sources = [SeedFileSource::new(source, seed)];
            let saved = register_discovered(&cancel, &repo, &sources, &config)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("Registered {saved} new manuals");
        }
        Commands::Download(args) => cmd_download(&cancel, repo, args).await?,
        Commands::Requeue { limit } => {
            let requeued = repo
                .requeue_failed(limit)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("Requeued {requeued} failed manuals");
        }
        Commands::Stats => {
            let stats = repo.stats().await.map_err(|e| anyhow::anyhow!(e))?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::List {
            status,
            limit,
            make,
        } => {
            let entries = match make {
                Some(make) => repo.list_by_make(&make, limit).await,
                None => repo.list_by_status(status, limit).await,
            }
            .map_err(|e| anyhow::anyhow!(e))?;

            if entries.is_empty() {
                println!("No manuals found");
                return Ok(());
            }
            for entry in &entries {
                println!(
                    "  [{}] {} {} {} {} ({}) {}",
                    entry.status,
                    &entry.id[..entry.id.len().min(8)],
                    entry.year,
                    entry.make,
                    entry.model,
                    entry.manual_type,
                    entry.local_path.as_deref().unwrap_or(&entry.url),
                );
                if let Some(error) = &entry.error {
                    println!("         error: {error}");
                }
            }
            println!("\nTotal: {} manuals", entries.len());
        }
    }

    Ok(())
}

async fn connect_db(url: Option<&str>, max_connections: u32) -> Result<ManualRepository> {
    let url = url.context("DATABASE_URL not set. Pass --database-url or set the variable")?;
    let db = Database::open(url, max_connections)
        .await
        .context("Failed to open manual registry")?;
    Ok(db.manual_repo())
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing in-flight downloads");
            cancel.cancel();
        }
    });
}

fn resilience_policy(args: &DownloadArgs) -> Result<ResiliencePolicy> {
    let retry = RetryOpts::new(
        args.retries,
        Duration::from_millis(args.retry_wait_ms),
        Duration::from_secs(30),
    )
    .with_jitter(true);
    let mut policy = ResiliencePolicy::new(retry);

    if args.breaker_threshold > 0 {
        policy = policy.with_breaker(CircuitBreaker::new(
            "manual-downloads",
            CircuitBreakerConfig {
                failure_threshold: args.breaker_threshold,
                open_timeout: Duration::from_secs(args.breaker_timeout_secs),
                half_open_max: 1,
            },
        ));
    }
    if args.rate > 0.0 {
        let limiter = RateLimiter::new(
            "manual-downloads",
            RateLimiterConfig::new(args.rate, args.burst),
        )
        .map_err(|e| anyhow::anyhow!(e))?;
        policy = policy.with_limiter(limiter);
    }
    Ok(policy)
}

async fn cmd_download(
    cancel: &CancellationToken,
    repo: ManualRepository,
    args: DownloadArgs,
) -> Result<()> {
    let policy = resilience_policy(&args)?;
    let downloader = PdfDownloader::new(PdfDownloaderConfig {
        output_dir: args.output_dir.clone(),
        max_file_size: args.max_size_mb * 1024 * 1024,
        user_agent: args.user_agent.clone(),
        timeout: Duration::from_secs(args.timeout_secs),
    })
    .context("Failed to create HTTP client")?;

    let config = DownloadConfig {
        concurrency: args.concurrency,
        pause: Duration::from_millis(args.pause_ms),
        ..Default::default()
    };

    tracing::info!(
        output_dir = %args.output_dir.display(),
        concurrency = config.concurrency,
        "Starting download run"
    );

    let orchestrator = DownloadOrchestrator::with_fetcher(repo, downloader, &policy, config);
    let report = orchestrator
        .download(cancel, args.limit)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    if let Some(breaker) = &policy.breaker {
        let stats = breaker.stats();
        tracing::info!(
            state = %stats.state,
            consecutive_failures = stats.consecutive_failures,
            "Circuit breaker at end of run"
        );
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
