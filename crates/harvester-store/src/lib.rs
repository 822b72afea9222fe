//! `harvester-store`: execution history and trigger rows.
//!
//! The executor and the trigger subsystem only see the [`ExecutionStore`] and
//! [`TriggerStore`] traits. [`SqliteStore`] implements both on a single
//! SQLite connection, the same file the rest of the host application uses.
//!
//! # Orphan cleanup
//!
//! A process that dies mid-run leaves rows in `running`. Call
//! [`ExecutionStore::mark_orphans_failed`] once at startup, before any new
//! execution starts, to reclassify them as `failed`.

pub mod db;
pub mod error;
pub mod sqlite;
pub mod types;

pub use error::{Result, StoreError};
pub use sqlite::SqliteStore;
pub use types::{
    ExecutionFilter, ExecutionRecord, ExecutionUpdate, NewExecution, Pagination, SortOrder,
    TriggerRow,
};

use harvester_core::ExecutionId;

/// Error message written into rows reclassified by orphan cleanup.
pub const ORPHAN_ERROR: &str = "Execution interrupted by abnormal process shutdown";

/// Persistence of execution history.
pub trait ExecutionStore: Send + Sync {
    fn create(&self, execution: &NewExecution) -> Result<()>;

    /// Returns `NotFound` if no row has this id.
    fn update(&self, id: &ExecutionId, update: &ExecutionUpdate) -> Result<()>;

    fn find_many(
        &self,
        filter: &ExecutionFilter,
        page: Pagination,
        order: SortOrder,
    ) -> Result<Vec<ExecutionRecord>>;

    fn find_unique(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>>;

    /// Reclassify every `running` row as `failed` with [`ORPHAN_ERROR`].
    /// Returns how many rows changed.
    fn mark_orphans_failed(&self) -> Result<usize>;
}

/// Persistence of database-managed triggers.
pub trait TriggerStore: Send + Sync {
    fn list_triggers(&self) -> Result<Vec<TriggerRow>>;

    fn get_trigger(&self, id: &str) -> Result<Option<TriggerRow>>;

    /// Returns `Conflict` if the id is taken.
    fn insert_trigger(&self, row: &TriggerRow) -> Result<()>;

    /// Returns `NotFound` if the id is unknown.
    fn update_trigger(&self, row: &TriggerRow) -> Result<()>;

    /// Returns `NotFound` if the id is unknown.
    fn delete_trigger(&self, id: &str) -> Result<()>;
}
