use harvester_store::StoreError;
use thiserror::Error;

/// Errors raised while loading, validating and scheduling triggers.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// Two records claim the same trigger id. Never resolved by overwriting.
    #[error("Trigger id conflict: {id} from {second} collides with the entry from {first}")]
    IdConflict {
        id: String,
        first: String,
        second: String,
    },

    /// One record failed schema validation.
    #[error("Invalid trigger {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Trigger not found: {id}")]
    NotFound { id: String },

    #[error("Trigger already exists: {id}")]
    AlreadyExists { id: String },

    /// A provider could not produce its records at all.
    #[error("Provider {provider} failed: {reason}")]
    Provider { provider: String, reason: String },

    #[error("Trigger store error: {0}")]
    Store(#[from] StoreError),
}

impl TriggerError {
    pub(crate) fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        TriggerError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TriggerError>;
