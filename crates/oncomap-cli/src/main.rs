use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use oncomap_storage::Store;
use oncomap_sync::{
    maybe_build_scheduler, RefreshAllOptions, RefreshEngine, SyncConfig, ALLOWED_RADII_KM,
};
use oncomap_web::{AppState, WebConfig};

#[derive(Debug, Parser)]
#[command(name = "oncomap")]
#[command(about = "Curated-center office map: refresh pipeline and JSON API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the API server (and the cron scheduler when enabled).
    Serve,
    /// Run one cursor-resumable refresh batch.
    RefreshBatch,
    /// Sweep every active center.
    RefreshAll {
        #[arg(long)]
        full_clean: bool,
        #[arg(long)]
        delay_ms: Option<u64>,
        #[arg(long)]
        batch_size: Option<i64>,
        #[arg(long)]
        radius_km: Option<u32>,
        #[arg(long)]
        max_offices: Option<usize>,
        #[arg(long)]
        center_retry_count: Option<u32>,
        #[arg(long)]
        retry_delay_ms: Option<u64>,
    },
    /// Apply pending database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let store = open_store().await?;
            let engine = Arc::new(RefreshEngine::from_config(
                store.clone(),
                SyncConfig::from_env(),
            )?);
            if let Some(scheduler) = maybe_build_scheduler(engine.clone()).await? {
                scheduler.start().await?;
            }
            let state = AppState::new(store, engine, WebConfig::from_env());
            oncomap_web::serve(state).await?;
        }
        Commands::RefreshBatch => {
            let engine = engine().await?;
            let summary = engine.run_scheduled_refresh().await?;
            println!(
                "batch complete: processed={} failed={} cursor={} links_upserted={}",
                summary.centers_processed,
                summary.centers_failed,
                summary.cursor,
                summary.totals.links_upserted
            );
        }
        Commands::RefreshAll {
            full_clean,
            delay_ms,
            batch_size,
            radius_km,
            max_offices,
            center_retry_count,
            retry_delay_ms,
        } => {
            if let Some(km) = radius_km {
                if !ALLOWED_RADII_KM.contains(&km) {
                    bail!("--radius-km must be one of 10, 25, 50, 100");
                }
            }
            let engine = engine().await?;
            let summary = engine
                .run_refresh_all(RefreshAllOptions {
                    throttle_ms: delay_ms,
                    batch_size,
                    radius_km,
                    max_offices,
                    full_clean,
                    center_retry_count,
                    retry_delay_ms,
                })
                .await?;
            println!(
                "refresh-all complete: ok={} processed={} failed={} links_upserted={} pruned={}",
                summary.ok,
                summary.centers_processed,
                summary.centers_failed,
                summary.totals.links_upserted,
                summary.totals.pruned_links
            );
        }
        Commands::Migrate => {
            let path = database_path();
            let store = Store::open(&path).await?;
            let applied = store.migrate().await?;
            println!("migrations applied: {applied} ({path})");
        }
    }

    Ok(())
}

fn database_path() -> String {
    std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./oncomap.db".to_string())
}

async fn open_store() -> Result<Store> {
    let store = Store::open(&database_path()).await?;
    store.migrate().await?;
    Ok(store)
}

async fn engine() -> Result<RefreshEngine> {
    let store = open_store().await?;
    Ok(RefreshEngine::from_config(store, SyncConfig::from_env())?)
}
