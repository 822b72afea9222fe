//! `harvester-core`: types shared by every harvester crate.
//!
//! Holds the cancellation primitive used by the executor and the trigger
//! manager, the identifiers and status enums that cross crate boundaries, and
//! the figment-backed process configuration.

pub mod cancel;
pub mod config;
pub mod error;
pub mod types;

pub use cancel::{CancelSignal, CancelSubscription};
pub use config::HarvesterConfig;
pub use error::{HarvesterError, Result};
pub use types::{ExecutionId, ExecutionStatus, OverlapPolicy, TriggerSource};
