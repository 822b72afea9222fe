use chrono::{DateTime, Utc};
use harvester_core::{ExecutionId, ExecutionStatus, OverlapPolicy, TriggerSource};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Row written when an execution starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExecution {
    pub id: ExecutionId,
    pub task_name: String,
    pub trigger_source: TriggerSource,
    pub trigger_name: Option<String>,
    pub params: JsonValue,
    pub status: ExecutionStatus,
    pub max_retries: u32,
    pub started_at: DateTime<Utc>,
}

/// Fields changed when an execution settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionUpdate {
    pub status: ExecutionStatus,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

/// A persisted execution history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub task_name: String,
    pub trigger_source: TriggerSource,
    pub trigger_name: Option<String>,
    pub params: JsonValue,
    pub status: ExecutionStatus,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

/// History query filter. Every `None` field matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    pub task_name: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub trigger_source: Option<TriggerSource>,
    pub trigger_name: Option<String>,
    /// Inclusive lower bound on `started_at`.
    pub started_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `started_at`.
    pub started_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Ordering by `started_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// A database-managed trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRow {
    pub id: String,
    pub name: String,
    pub task_name: String,
    pub cron: String,
    pub params: JsonValue,
    pub enabled: bool,
    pub description: Option<String>,
    pub overlap: OverlapPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
