use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, info};

use minerwatch::config::{Config, DatabaseConfig};
use minerwatch::http::{self, AppState};
use minerwatch::registry::DeviceRegistry;
use minerwatch::scheduler::CollectionScheduler;
use minerwatch::settings::PgSettings;
use minerwatch::store::{HistoryStore, PgStore};

#[derive(Parser, Debug)]
#[command(name = "minerwatch", about = "Mining device monitoring agent")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/minerwatch/config.toml")]
    config: String,

    /// Validate config and exit
    #[arg(long)]
    check: bool,

    /// Print version and exit
    #[arg(short, long)]
    version: bool,
}

#[tokio::main(worker_threads = 2)]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("minerwatch {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Load configuration
    let config = Config::load(&cli.config)?;

    if cli.check {
        println!("Configuration is valid.");
        return Ok(());
    }

    // Initialize logging
    init_logging(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting minerwatch agent"
    );

    // Run the agent
    if let Err(e) = run(config).await {
        error!(error = %e, "Agent terminated with error");
        return Err(e);
    }

    Ok(())
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(&config.agent.log_level)
        });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    // The store must be reachable at startup; this is the only fatal
    // dependency. Everything after this point degrades per device.
    let pool = connect_with_retry(&config.database).await?;

    let store = PgStore::new(pool.clone());
    store.ensure_schema().await?;
    let store: Arc<dyn HistoryStore> = Arc::new(store);

    let settings = Arc::new(PgSettings::new(pool));
    let registry = Arc::new(DeviceRegistry::new(store.clone()));

    let scheduler = Arc::new(CollectionScheduler::new(
        store,
        settings,
        registry,
        &config.collector,
        config.alerting.clone(),
    )?);

    // Control API
    let state = Arc::new(AppState { scheduler: scheduler.clone() });
    let bind = config.agent.http_bind.clone();
    tokio::spawn(async move {
        if let Err(e) = http::serve(&bind, state).await {
            error!(error = %e, "control API server failed");
        }
    });

    // Faster device-list refresh between collection cycles
    tokio::spawn(scheduler.clone().run_device_check());

    // Collection loop; the first cycle runs immediately
    tokio::spawn(scheduler.run());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, exiting");

    Ok(())
}

async fn connect_with_retry(config: &DatabaseConfig) -> Result<PgPool> {
    let attempts = config.connect_attempts.max(1);

    for attempt in 1..=attempts {
        match PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
        {
            Ok(pool) => {
                info!("database connection established");
                return Ok(pool);
            }
            Err(e) if attempt < attempts => {
                info!(
                    attempt,
                    attempts,
                    error = %e,
                    "database not ready, retrying"
                );
                tokio::time::sleep(Duration::from_secs(config.connect_retry_secs)).await;
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context("could not connect to database after maximum retries"));
            }
        }
    }

    unreachable!("retry loop returns on the final attempt");
}
