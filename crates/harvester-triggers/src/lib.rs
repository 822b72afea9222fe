//! `harvester-triggers`: cron triggers driven by layered config.
//!
//! ```text
//! providers ──► ConfigLoader ──► ConfigManager ──► CronTriggerManager ──► TaskExecutor
//!  (file, inline,   merge by id,     authoritative map,    one timer per enabled
//!   trigger store)  reject clashes   hash, change events   trigger, fire-and-forget
//! ```
//!
//! [`TriggerService`] is the write path for database-managed triggers: it
//! updates the trigger store and mirrors the change into the manager so the
//! schedule follows immediately.

pub mod error;
pub mod loader;
pub mod manager;
pub mod provider;
pub mod schedule;
pub mod schema;
pub mod service;
pub mod trigger_manager;

pub use error::{Result, TriggerError};
pub use loader::ConfigLoader;
pub use manager::{ConfigChangeEvent, ConfigListener, ConfigManager, ReloadOutcome};
pub use provider::{
    ConfigProvider, FileProvider, InlineProvider, StoreProvider, STORE_PROVIDER_NAME,
};
pub use schema::{
    content_hash, derive_static_id, TriggerConfigEntry, TriggerConfigSource, TriggerOrigin,
};
pub use service::{NewTrigger, TriggerPatch, TriggerService};
pub use trigger_manager::{CronTriggerManager, ReconcileReport, ScheduledTrigger, TimerStats};
