//! Config providers: independent sources of trigger records.
//!
//! A provider drops invalid records on its own (logged, load continues) and
//! only fails as a whole when it cannot read its source at all.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use figment::providers::{Format, Toml};
use figment::Figment;
use harvester_core::CancelSignal;
use harvester_store::TriggerStore;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Result, TriggerError};
use crate::schema::{self, RawTrigger, TriggerConfigSource, TriggerOrigin};

/// Provider name used for trigger store rows.
pub const STORE_PROVIDER_NAME: &str = "database";

#[async_trait]
pub trait ConfigProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self) -> Result<Vec<TriggerConfigSource>>;

    /// Push-style change notification for sources that can detect their own
    /// mutations. Each message means "reload me". The watcher stops when
    /// `shutdown` fires.
    fn subscribe(&self, _shutdown: CancelSignal) -> Option<mpsc::Receiver<()>> {
        None
    }
}

fn keep_valid(
    provider: &str,
    records: Vec<JsonValue>,
    origin: TriggerOrigin,
) -> Vec<TriggerConfigSource> {
    let total = records.len();
    let valid: Vec<TriggerConfigSource> = records
        .into_iter()
        .enumerate()
        .filter_map(|(index, record)| match schema::parse_record(record, origin) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                warn!(provider, index, error = %e, "dropping invalid trigger record");
                None
            }
        })
        .collect();
    debug!(provider, total, valid = valid.len(), "provider records validated");
    valid
}

/// `[[triggers]]` array of a static TOML file.
#[derive(Debug, Default, Deserialize)]
struct TriggerFile {
    #[serde(default)]
    triggers: Vec<JsonValue>,
}

/// Static trigger file, re-read on every load.
pub struct FileProvider {
    path: PathBuf,
    watch_interval: Option<Duration>,
}

impl FileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            watch_interval: None,
        }
    }

    /// Poll the file's modification time at `interval` and notify on change.
    pub fn watch_every(mut self, interval: Duration) -> Self {
        self.watch_interval = Some(interval).filter(|i| !i.is_zero());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn provider_error(&self, reason: impl Into<String>) -> TriggerError {
        TriggerError::Provider {
            provider: self.name().to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ConfigProvider for FileProvider {
    fn name(&self) -> &str {
        "file"
    }

    async fn load(&self) -> Result<Vec<TriggerConfigSource>> {
        if !self.path.exists() {
            return Err(self.provider_error(format!("{} does not exist", self.path.display())));
        }
        let file: TriggerFile = Figment::new()
            .merge(Toml::file(&self.path))
            .extract()
            .map_err(|e| self.provider_error(e.to_string()))?;
        Ok(keep_valid(self.name(), file.triggers, TriggerOrigin::Static))
    }

    fn subscribe(&self, shutdown: CancelSignal) -> Option<mpsc::Receiver<()>> {
        let interval = self.watch_interval?;
        let path = self.path.clone();
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let mut last = modified(&path).await;
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            info!(path = %path.display(), interval_ms = interval.as_millis() as u64, "watching trigger file");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let current = modified(&path).await;
                        if current != last {
                            last = current;
                            info!(path = %path.display(), "trigger file changed");
                            // A full channel already holds a pending reload.
                            if let Err(mpsc::error::TrySendError::Closed(())) = tx.try_send(()) {
                                break;
                            }
                        }
                    }
                }
            }
            debug!(path = %path.display(), "trigger file watcher stopped");
        });

        Some(rx)
    }
}

async fn modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

/// Records declared directly in the process config.
pub struct InlineProvider {
    name: String,
    records: Vec<JsonValue>,
}

impl InlineProvider {
    pub fn new(name: impl Into<String>, records: Vec<JsonValue>) -> Self {
        Self {
            name: name.into(),
            records,
        }
    }
}

#[async_trait]
impl ConfigProvider for InlineProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> Result<Vec<TriggerConfigSource>> {
        Ok(keep_valid(&self.name, self.records.clone(), TriggerOrigin::Static))
    }
}

/// Rows of the trigger store.
pub struct StoreProvider {
    store: Arc<dyn TriggerStore>,
}

impl StoreProvider {
    pub fn new(store: Arc<dyn TriggerStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ConfigProvider for StoreProvider {
    fn name(&self) -> &str {
        STORE_PROVIDER_NAME
    }

    async fn load(&self) -> Result<Vec<TriggerConfigSource>> {
        let rows = self.store.list_triggers().map_err(|e| TriggerError::Provider {
            provider: STORE_PROVIDER_NAME.to_string(),
            reason: e.to_string(),
        })?;
        let valid = rows
            .iter()
            .filter_map(|row| {
                match schema::validate(RawTrigger::from(row), TriggerOrigin::Database) {
                    Ok(cfg) => Some(cfg),
                    Err(e) => {
                        warn!(trigger_id = %row.id, error = %e, "dropping invalid trigger row");
                        None
                    }
                }
            })
            .collect();
        Ok(valid)
    }
}
