//! Name → definition table, filled once at startup.
//!
//! Registration takes `&mut self`, so it can only happen before the registry
//! is shared. After that it sits behind an `Arc` and lookups are plain reads,
//! safe from any number of concurrent executions. There is no unregister:
//! every trigger must point at a task whose shape was known at deploy time.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Result, TaskError};
use crate::handler::TaskHandler;
use crate::types::TaskOptions;

/// A registered task: handler plus its static options.
pub struct TaskDefinition {
    pub name: String,
    pub description: Option<String>,
    pub options: TaskOptions,
    handler: Arc<dyn TaskHandler>,
}

impl TaskDefinition {
    pub fn handler(&self) -> Arc<dyn TaskHandler> {
        Arc::clone(&self.handler)
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            timeout_ms: self
                .options
                .effective_timeout()
                .map(|t| t.as_millis() as u64),
            retries: self.options.retries,
        }
    }
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a definition, without the handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub name: String,
    pub description: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retries: u32,
}

/// One task offered by a [`TaskSource`].
pub struct TaskDeclaration {
    pub name: String,
    pub description: Option<String>,
    pub options: TaskOptions,
    pub handler: Arc<dyn TaskHandler>,
}

impl TaskDeclaration {
    pub fn new(name: impl Into<String>, handler: impl TaskHandler + 'static) -> Self {
        Self {
            name: name.into(),
            description: None,
            options: TaskOptions::default(),
            handler: Arc::new(handler),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }
}

/// A statically written group of tasks, usually all bound to one owning
/// instance through an [`InstanceCell`](crate::handler::InstanceCell).
pub trait TaskSource {
    /// Label used in logs.
    fn name(&self) -> &str;

    fn tasks(&self) -> Vec<TaskDeclaration>;
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<TaskDefinition>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one task. A second registration under the same name is
    /// rejected with `NameConflict` and the first one stays in place.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        options: TaskOptions,
    ) -> Result<()> {
        self.insert(name.into(), None, handler, options)
    }

    /// Register every task a source declares. Stops at the first conflict;
    /// tasks registered before it stay registered, and startup is expected
    /// to abort on the error.
    pub fn register_source(&mut self, source: &dyn TaskSource) -> Result<usize> {
        let declarations = source.tasks();
        let count = declarations.len();
        for decl in declarations {
            self.insert(decl.name, decl.description, decl.handler, decl.options)?;
        }
        info!(source = source.name(), count, "task source registered");
        Ok(count)
    }

    fn insert(
        &mut self,
        name: String,
        description: Option<String>,
        handler: Arc<dyn TaskHandler>,
        options: TaskOptions,
    ) -> Result<()> {
        if self.tasks.contains_key(&name) {
            return Err(TaskError::NameConflict { name });
        }
        debug!(task = %name, retries = options.retries, timeout = ?options.timeout, "task registered");
        self.tasks.insert(
            name.clone(),
            Arc::new(TaskDefinition {
                name,
                description,
                options,
                handler,
            }),
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<TaskDefinition>> {
        self.tasks.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// All definitions, without handlers, sorted by name.
    pub fn list(&self) -> Vec<TaskInfo> {
        let mut infos: Vec<TaskInfo> = self.tasks.values().map(|d| d.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
