use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use harvester_core::{CancelSignal, HarvesterConfig};
use harvester_store::{ExecutionStore, SqliteStore};
use harvester_tasks::{LoggingMiddleware, PersistenceMiddleware, TaskExecutor, TaskRegistry};
use harvester_triggers::{
    ConfigLoader, ConfigManager, CronTriggerManager, FileProvider, InlineProvider, ReloadOutcome,
    StoreProvider,
};
use tracing::{info, warn};

mod tasks;

#[derive(Parser, Debug)]
#[command(name = "harvester-daemon", about = "Runs registered tasks on cron triggers")]
struct CliArgs {
    /// Path to the TOML config file. Falls back to HARVESTER_CONFIG, then
    /// ~/.harvester/harvester.toml.
    #[arg(long)]
    config: Option<String>,

    /// Overrides `database.path` from the config.
    #[arg(long)]
    db_path: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    // config path: --config > HARVESTER_CONFIG env > ~/.harvester/harvester.toml
    let config_path = args
        .config
        .clone()
        .or_else(|| std::env::var("HARVESTER_CONFIG").ok());
    let loaded = HarvesterConfig::load(config_path.as_deref());
    let mut config = loaded.as_ref().cloned().unwrap_or_default();
    if let Some(path) = args.db_path {
        config.database.path = path;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.as_str().into()),
        )
        .init();
    if let Err(e) = &loaded {
        warn!("Config load failed ({}), using defaults", e);
    }

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    let store = Arc::new(SqliteStore::new(db)?);

    match store.mark_orphans_failed() {
        Ok(0) => {}
        Ok(n) => warn!(count = n, "marked executions left running by a previous process as failed"),
        Err(e) => warn!(error = %e, "orphan cleanup failed"),
    }

    let mut registry = TaskRegistry::new();
    registry.register_source(&tasks::BuiltinSource::new())?;
    let registry = Arc::new(registry);
    info!(tasks = registry.len(), "task registry ready");

    let executor = Arc::new(TaskExecutor::new(Arc::clone(&registry), &config.executor));
    executor.use_middleware(Arc::new(LoggingMiddleware::new()));
    executor.use_middleware(Arc::new(PersistenceMiddleware::new(store.clone())));

    // providers in precedence-free order; duplicate ids across them are fatal
    let mut loader = ConfigLoader::new();
    if let Some(file) = &config.triggers.file {
        let watch = Duration::from_secs(config.triggers.watch_interval_secs);
        loader.add_provider(Arc::new(FileProvider::new(file).watch_every(watch)));
    }
    if !config.triggers.inline.is_empty() {
        loader.add_provider(Arc::new(InlineProvider::new(
            "inline",
            config.triggers.inline.clone(),
        )));
    }
    loader.add_provider(Arc::new(StoreProvider::new(store.clone())));

    let manager = Arc::new(ConfigManager::new(loader));
    match manager.reload().await? {
        ReloadOutcome::Applied { triggers } => info!(triggers, "trigger config loaded"),
        ReloadOutcome::Unchanged => info!("no triggers configured"),
        ReloadOutcome::Superseded => warn!("initial trigger load raced with changes, starting empty"),
    }

    let crons = Arc::new(CronTriggerManager::new(Arc::clone(&executor)));
    let report = crons.initialize(&manager);
    info!(started = report.started, "cron triggers scheduled");

    let shutdown = CancelSignal::new();
    let mut background = manager.watch_providers(shutdown.clone());
    if config.triggers.reload_interval_secs > 0 {
        background.push(manager.spawn_periodic_reload(
            Duration::from_secs(config.triggers.reload_interval_secs),
            shutdown.clone(),
        ));
    }

    info!("Harvester daemon running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    shutdown.cancel();
    crons.shutdown();
    executor.shutdown();
    for handle in background {
        if let Err(e) = handle.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
