use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info};

use crate::error::{Result, TriggerError};
use crate::provider::ConfigProvider;
use crate::schema::TriggerConfigEntry;

/// Asks every provider for its records and merges them by id.
#[derive(Default)]
pub struct ConfigLoader {
    providers: Vec<Arc<dyn ConfigProvider>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn add_provider(&mut self, provider: Arc<dyn ConfigProvider>) {
        self.providers.push(provider);
    }

    pub fn providers(&self) -> &[Arc<dyn ConfigProvider>] {
        &self.providers
    }

    /// Load and merge every provider, in registration order.
    ///
    /// A provider whose `load` fails contributes nothing and the rest carry
    /// on. Two records with the same id fail the whole load with
    /// `IdConflict`; neither one wins.
    pub async fn load_all(&self) -> Result<Vec<TriggerConfigEntry>> {
        let mut merged: Vec<TriggerConfigEntry> = Vec::new();
        let mut owners: HashMap<String, String> = HashMap::new();

        for provider in &self.providers {
            let configs = match provider.load().await {
                Ok(configs) => configs,
                Err(e) => {
                    error!(provider = provider.name(), error = %e, "provider load failed, skipping");
                    continue;
                }
            };

            for config in configs {
                if let Some(first) = owners.get(&config.id) {
                    return Err(TriggerError::IdConflict {
                        id: config.id,
                        first: first.clone(),
                        second: provider.name().to_string(),
                    });
                }
                owners.insert(config.id.clone(), provider.name().to_string());
                merged.push(TriggerConfigEntry::new(config, provider.name()));
            }
        }

        info!(
            providers = self.providers.len(),
            triggers = merged.len(),
            "trigger config loaded"
        );
        Ok(merged)
    }
}
