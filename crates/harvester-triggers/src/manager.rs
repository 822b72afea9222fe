//! Authoritative in-memory trigger config and its change events.
//!
//! Every mutation (CRUD call or full reload) happens under one lock, and
//! listeners are notified before that lock is released, so they always see
//! events in the order the mutations happened. Listeners get a snapshot of
//! the full config with each event and must not call back into the
//! manager's mutating methods.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use harvester_core::CancelSignal;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TriggerError};
use crate::loader::ConfigLoader;
use crate::schema::{self, TriggerConfigEntry, TriggerConfigSource};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConfigChangeEvent {
    Add { entry: TriggerConfigEntry },
    Update { entry: TriggerConfigEntry },
    Delete { entry: TriggerConfigEntry },
    /// A full reload replaced the config set.
    Reload { hash: String },
}

/// Receives config changes. Errors and panics are logged per listener.
pub trait ConfigListener: Send + Sync {
    fn name(&self) -> &str;

    fn on_change(
        &self,
        event: &ConfigChangeEvent,
        current: &[TriggerConfigEntry],
    ) -> anyhow::Result<()>;
}

/// Result of [`ConfigManager::reload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Content hash matched the current one; nothing was touched.
    Unchanged,
    Applied { triggers: usize },
    /// Every load raced with a CRUD call; the current set was kept.
    Superseded,
}

/// Loads that raced with a mutation are retried this many times in total.
const RELOAD_ROUNDS: usize = 3;

#[derive(Default)]
struct State {
    entries: BTreeMap<String, TriggerConfigEntry>,
    hash: Option<String>,
    /// Bumped by every mutation.
    generation: u64,
}

impl State {
    fn snapshot(&self) -> Vec<TriggerConfigEntry> {
        self.entries.values().cloned().collect()
    }

    fn rehash(&mut self) {
        self.hash = Some(schema::content_hash(self.entries.values().map(|e| &e.config)));
        self.generation += 1;
    }
}

pub struct ConfigManager {
    loader: ConfigLoader,
    state: Mutex<State>,
    listeners: RwLock<Vec<Arc<dyn ConfigListener>>>,
}

impl ConfigManager {
    pub fn new(loader: ConfigLoader) -> Self {
        Self {
            loader,
            state: Mutex::new(State::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("trigger config poisoned")
    }

    pub fn subscribe(&self, listener: Arc<dyn ConfigListener>) {
        debug!(listener = listener.name(), "config listener subscribed");
        self.listeners
            .write()
            .expect("config listeners poisoned")
            .push(listener);
    }

    /// Every entry, ordered by id.
    pub fn entries(&self) -> Vec<TriggerConfigEntry> {
        self.state().snapshot()
    }

    pub fn get(&self, id: &str) -> Option<TriggerConfigEntry> {
        self.state().entries.get(id).cloned()
    }

    /// Hash of the current config set, `None` before the first load.
    pub fn hash(&self) -> Option<String> {
        self.state().hash.clone()
    }

    pub fn add(&self, config: TriggerConfigSource, provider: &str) -> Result<()> {
        let mut state = self.state();
        if state.entries.contains_key(&config.id) {
            return Err(TriggerError::AlreadyExists { id: config.id });
        }
        let entry = TriggerConfigEntry::new(config, provider);
        state.entries.insert(entry.id().to_string(), entry.clone());
        state.rehash();
        info!(trigger_id = %entry.id(), name = %entry.config.name, "trigger added");
        self.emit(&ConfigChangeEvent::Add { entry }, &state.snapshot());
        Ok(())
    }

    pub fn update(&self, config: TriggerConfigSource, provider: &str) -> Result<()> {
        let mut state = self.state();
        if !state.entries.contains_key(&config.id) {
            return Err(TriggerError::NotFound { id: config.id });
        }
        let entry = TriggerConfigEntry::new(config, provider);
        state.entries.insert(entry.id().to_string(), entry.clone());
        state.rehash();
        info!(trigger_id = %entry.id(), "trigger updated");
        self.emit(&ConfigChangeEvent::Update { entry }, &state.snapshot());
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        let entry = state
            .entries
            .remove(id)
            .ok_or_else(|| TriggerError::NotFound { id: id.to_string() })?;
        state.rehash();
        info!(trigger_id = %id, "trigger deleted");
        self.emit(&ConfigChangeEvent::Delete { entry }, &state.snapshot());
        Ok(())
    }

    /// Reload every provider and replace the config set.
    ///
    /// An unchanged content hash is a no-op: no state change, no event. A
    /// load error (an id conflict) leaves the current set in place. Loading
    /// runs without the lock, so a load that overlaps a CRUD call is thrown
    /// away and repeated rather than overwriting the newer state.
    pub async fn reload(&self) -> Result<ReloadOutcome> {
        for round in 1..=RELOAD_ROUNDS {
            let generation = self.state().generation;
            let loaded = self.loader.load_all().await?;
            let hash = schema::content_hash(loaded.iter().map(|e| &e.config));

            let mut state = self.state();
            if state.generation != generation {
                debug!(round, "trigger config changed during load, loading again");
                continue;
            }
            if state.hash.as_deref() == Some(hash.as_str()) {
                debug!(%hash, "trigger config unchanged");
                return Ok(ReloadOutcome::Unchanged);
            }

            state.entries = loaded
                .into_iter()
                .map(|e| (e.id().to_string(), e))
                .collect();
            state.hash = Some(hash.clone());
            state.generation += 1;
            let triggers = state.entries.len();
            info!(triggers, %hash, "trigger config replaced");
            self.emit(&ConfigChangeEvent::Reload { hash }, &state.snapshot());
            return Ok(ReloadOutcome::Applied { triggers });
        }
        warn!(rounds = RELOAD_ROUNDS, "trigger config kept changing during reload, skipped");
        Ok(ReloadOutcome::Superseded)
    }

    fn emit(&self, event: &ConfigChangeEvent, current: &[TriggerConfigEntry]) {
        let listeners = self
            .listeners
            .read()
            .expect("config listeners poisoned")
            .clone();
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_change(event, current))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(listener = listener.name(), error = %format!("{e:#}"), "config listener failed")
                }
                Err(_) => error!(listener = listener.name(), "config listener panicked"),
            }
        }
    }

    /// Turn provider change notifications into full reloads until
    /// `shutdown` fires. Returns one handle per watching provider.
    pub fn watch_providers(self: &Arc<Self>, shutdown: CancelSignal) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for provider in self.loader.providers() {
            let Some(mut rx) = provider.subscribe(shutdown.clone()) else {
                continue;
            };
            let name = provider.name().to_string();
            let this = Arc::clone(self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        msg = rx.recv() => {
                            if msg.is_none() {
                                break;
                            }
                            info!(provider = %name, "provider reported a change, reloading");
                            if let Err(e) = this.reload().await {
                                error!(provider = %name, error = %e, "pushed reload failed");
                            }
                        }
                    }
                }
                debug!(provider = %name, "provider watch stopped");
            }));
        }
        handles
    }

    /// Reload every `interval` until `shutdown` fires.
    pub fn spawn_periodic_reload(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancelSignal,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            info!(interval_secs = interval.as_secs(), "periodic trigger reload started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match this.reload().await {
                        Ok(ReloadOutcome::Unchanged | ReloadOutcome::Superseded) => {}
                        Ok(ReloadOutcome::Applied { triggers }) => {
                            info!(triggers, "periodic reload applied changes")
                        }
                        Err(e) => warn!(error = %e, "periodic reload failed, keeping current config"),
                    },
                }
            }
            debug!("periodic trigger reload stopped");
        })
    }
}
