//! CRUD over database-managed triggers.
//!
//! Every write goes to the trigger store first and is then mirrored into the
//! [`ConfigManager`], so the cron schedule follows without waiting for the
//! next reload. Validation runs before anything is written.

use std::sync::Arc;

use chrono::Utc;
use harvester_core::OverlapPolicy;
use harvester_store::{StoreError, TriggerRow, TriggerStore};
use harvester_tasks::TaskRegistry;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, TriggerError};
use crate::manager::ConfigManager;
use crate::provider::STORE_PROVIDER_NAME;
use crate::schema::{self, RawTrigger, TriggerConfigSource, TriggerOrigin};

/// Fields of a new trigger.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTrigger {
    pub name: String,
    #[serde(alias = "taskName")]
    pub task_name: String,
    pub cron: String,
    #[serde(default)]
    pub params: Option<JsonValue>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub overlap: OverlapPolicy,
}

fn enabled_by_default() -> bool {
    true
}

/// Partial update. `None` leaves the field as it is.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerPatch {
    pub name: Option<String>,
    #[serde(alias = "taskName")]
    pub task_name: Option<String>,
    pub cron: Option<String>,
    pub params: Option<JsonValue>,
    pub enabled: Option<bool>,
    pub description: Option<String>,
    pub overlap: Option<OverlapPolicy>,
}

pub struct TriggerService {
    store: Arc<dyn TriggerStore>,
    manager: Arc<ConfigManager>,
    registry: Option<Arc<TaskRegistry>>,
}

impl TriggerService {
    pub fn new(store: Arc<dyn TriggerStore>, manager: Arc<ConfigManager>) -> Self {
        Self {
            store,
            manager,
            registry: None,
        }
    }

    /// Reject triggers that name a task nobody registered.
    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn list(&self) -> Result<Vec<TriggerRow>> {
        Ok(self.store.list_triggers()?)
    }

    pub fn get(&self, id: &str) -> Result<TriggerRow> {
        self.store
            .get_trigger(id)?
            .ok_or_else(|| TriggerError::NotFound { id: id.to_string() })
    }

    fn check(&self, raw: RawTrigger) -> Result<TriggerConfigSource> {
        let config = schema::validate(raw, TriggerOrigin::Database)?;
        if let Some(registry) = &self.registry {
            if !registry.contains(&config.task_name) {
                return Err(TriggerError::validation(
                    "taskName",
                    format!("no task named {}", config.task_name),
                ));
            }
        }
        Ok(config)
    }

    pub fn create(&self, input: NewTrigger) -> Result<TriggerRow> {
        let config = self.check(RawTrigger {
            id: Some(Uuid::new_v4().to_string()),
            name: input.name,
            task_name: input.task_name,
            cron: input.cron,
            params: input.params,
            enabled: input.enabled,
            description: input.description,
            overlap: input.overlap,
        })?;

        let now = Utc::now();
        let row = to_row(&config, now, now);
        self.store.insert_trigger(&row).map_err(|e| match e {
            StoreError::Conflict { id } => TriggerError::AlreadyExists { id },
            other => other.into(),
        })?;

        if let Err(e) = self.manager.add(config, STORE_PROVIDER_NAME) {
            // Keep store and schedule consistent.
            if let Err(undo) = self.store.delete_trigger(&row.id) {
                warn!(trigger_id = %row.id, error = %undo, "could not roll back trigger insert");
            }
            return Err(e);
        }
        info!(trigger_id = %row.id, name = %row.name, "trigger created");
        Ok(row)
    }

    pub fn update(&self, id: &str, patch: TriggerPatch) -> Result<TriggerRow> {
        let mut raw = RawTrigger::from(&self.get(id)?);
        if let Some(name) = patch.name {
            raw.name = name;
        }
        if let Some(task_name) = patch.task_name {
            raw.task_name = task_name;
        }
        if let Some(cron) = patch.cron {
            raw.cron = cron;
        }
        if let Some(params) = patch.params {
            raw.params = Some(params);
        }
        if let Some(enabled) = patch.enabled {
            raw.enabled = enabled;
        }
        if let Some(description) = patch.description {
            raw.description = Some(description);
        }
        if let Some(overlap) = patch.overlap {
            raw.overlap = overlap;
        }
        self.write(id, raw)
    }

    pub fn toggle(&self, id: &str, enabled: bool) -> Result<TriggerRow> {
        let mut raw = RawTrigger::from(&self.get(id)?);
        raw.enabled = enabled;
        self.write(id, raw)
    }

    fn write(&self, id: &str, raw: RawTrigger) -> Result<TriggerRow> {
        let created_at = self.get(id)?.created_at;
        let config = self.check(raw)?;
        let row = to_row(&config, created_at, Utc::now());
        self.store.update_trigger(&row).map_err(|e| match e {
            StoreError::NotFound { id } => TriggerError::NotFound { id },
            other => other.into(),
        })?;

        match self.manager.update(config.clone(), STORE_PROVIDER_NAME) {
            Ok(()) => {}
            // Row exists in the store but not yet in memory, e.g. it was
            // invalid at the last reload.
            Err(TriggerError::NotFound { .. }) => self.manager.add(config, STORE_PROVIDER_NAME)?,
            Err(e) => return Err(e),
        }
        info!(trigger_id = %id, enabled = row.enabled, "trigger updated");
        Ok(row)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.store.delete_trigger(id).map_err(|e| match e {
            StoreError::NotFound { id } => TriggerError::NotFound { id },
            other => other.into(),
        })?;
        match self.manager.delete(id) {
            Ok(()) | Err(TriggerError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        info!(trigger_id = %id, "trigger deleted");
        Ok(())
    }
}

fn to_row(
    config: &TriggerConfigSource,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
) -> TriggerRow {
    TriggerRow {
        id: config.id.clone(),
        name: config.name.clone(),
        task_name: config.task_name.clone(),
        cron: config.cron.clone(),
        params: config.params.clone(),
        enabled: config.enabled,
        description: config.description.clone(),
        overlap: config.overlap,
        created_at,
        updated_at,
    }
}
