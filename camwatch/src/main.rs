use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mimalloc::MiMalloc;
use tracing::{error, info};

use camwatch::config::load_config;
use camwatch::database;
use camwatch::logging::init_logging;
use camwatch::panic_hook;
use camwatch::services::ServiceContainer;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Adaptive liveness monitor for RTSP and HTTP snapshot cameras.
#[derive(Parser, Debug)]
#[command(name = "camwatch", version, about)]
struct Args {
    /// Configuration file; watched for changes while running
    #[arg(short, long, env = "CAMWATCH_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Overrides `[storage] database_url`
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Overrides `[server] listen`
    #[arg(long, env = "CAMWATCH_LISTEN")]
    listen: Option<String>,

    /// Overrides `[logging] dir`
    #[arg(long, env = "CAMWATCH_LOG_DIR")]
    log_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before clap reads them
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let (mut config, config_text) = load_config(&args.config)
        .await
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(url) = args.database_url {
        config.storage.database_url = url;
    }
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(dir) = args.log_dir {
        config.logging.dir = dir;
    }

    let (logging, _guard) = init_logging(&config.logging.dir, &config.logging.filter)
        .context("initializing logging")?;
    panic_hook::install(&config.logging.dir);

    let pool = database::init_pool_with_size(
        &config.storage.database_url,
        config.storage.max_connections,
    )
    .await
    .context("opening database")?;
    database::run_migrations(&pool)
        .await
        .context("running migrations")?;

    let retention_days = config.logging.retention_days;
    let container = ServiceContainer::new(&args.config, config, config_text, pool)
        .await
        .context("building services")?;
    container.initialize().await?;
    logging.start_retention_cleanup(retention_days, container.cancellation_token());
    container.start(Some(logging));

    info!("camwatch {} started", env!("CARGO_PKG_VERSION"));

    let token = container.cancellation_token();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        }
        _ = token.cancelled() => {}
    }

    container.shutdown().await?;
    Ok(())
}
