use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarvesterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HarvesterError {
    /// Short machine-readable code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            HarvesterError::Config(_) => "CONFIG_ERROR",
            HarvesterError::Serialization(_) => "SERIALIZATION_ERROR",
            HarvesterError::Io(_) => "IO_ERROR",
            HarvesterError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, HarvesterError>;
