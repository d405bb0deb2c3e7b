use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use frigg_sync::config;
use frigg_sync::store;
use frigg_sync::{MemoryModule, SyncManager};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run an initial sync between two record sets and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "sync.yaml")]
    config: PathBuf,

    /// Print an example config and exit
    #[arg(long)]
    print_example: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_example {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    let sync_config = cfg.sync.to_config()?;

    let pool = store::init_pool(&cfg.database_url).await?;
    store::run_migrations(&pool).await?;

    let primary = Arc::new(MemoryModule::with_records(
        cfg.primary.module.clone(),
        cfg.primary.entity.clone(),
        read_records(&cfg.primary.records).await?,
    ));
    let secondary = Arc::new(MemoryModule::with_records(
        cfg.secondary.module.clone(),
        cfg.secondary.entity.clone(),
        read_records(&cfg.secondary.records).await?,
    ));

    let manager = SyncManager::new(
        primary,
        secondary,
        sync_config,
        cfg.settings.clone(),
        pool,
    );

    info!(
        sync_type = %cfg.sync.name,
        primary = %cfg.primary.module,
        secondary = %cfg.secondary.module,
        "starting initial sync"
    );
    let report = manager.initial_sync().await?;
    info!(
        matched = report.matched,
        created = report.created_count(),
        updated = report.updated_count(),
        unchanged = report.unchanged,
        skipped = report.skipped_missing_match,
        failed = report.failure_count(),
        "initial sync finished"
    );

    if report.failure_count() > 0 {
        anyhow::bail!("{} records failed to sync", report.failure_count());
    }
    Ok(())
}

/// Read a JSON file mapping native record id -> native record.
async fn read_records(path: &str) -> Result<Vec<(String, Value)>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read records file {path}"))?;
    let map: BTreeMap<String, Value> = serde_json::from_str(&content)
        .with_context(|| format!("records file {path} is not an id -> record JSON object"))?;
    Ok(map.into_iter().collect())
}
