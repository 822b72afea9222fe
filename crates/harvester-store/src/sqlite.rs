use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use harvester_core::{ExecutionId, ExecutionStatus};
use rusqlite::types::{ToSql, Type};
use rusqlite::{Connection, Row};
use tracing::{debug, info, instrument, warn};

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::types::{
    ExecutionFilter, ExecutionRecord, ExecutionUpdate, NewExecution, Pagination, SortOrder,
    TriggerRow,
};
use crate::{ExecutionStore, TriggerStore, ORPHAN_ERROR};

const EXECUTION_COLUMNS: &str = "id, task_name, trigger_source, trigger_name, params, status,
     result, error, retry_count, max_retries, started_at, finished_at, duration_ms";

const TRIGGER_COLUMNS: &str =
    "id, name, task_name, cron, params, enabled, description, overlap, created_at, updated_at";

/// Thread-safe SQLite implementation of both stores.
///
/// Wraps a single connection in a `Mutex`; every call is a short statement so
/// contention stays low for a single-process deployment.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Wrap an open connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().expect("store connection poisoned")
    }
}

impl ExecutionStore for SqliteStore {
    #[instrument(skip(self, execution), fields(execution_id = %execution.id, task = %execution.task_name))]
    fn create(&self, execution: &NewExecution) -> Result<()> {
        let params_json = serde_json::to_string(&execution.params)?;
        let db = self.conn();
        db.execute(
            "INSERT INTO task_executions
             (id, task_name, trigger_source, trigger_name, params, status,
              retry_count, max_retries, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)",
            rusqlite::params![
                execution.id.as_str(),
                execution.task_name,
                execution.trigger_source.as_str(),
                execution.trigger_name,
                params_json,
                execution.status.as_str(),
                execution.max_retries,
                fmt_ts(&execution.started_at),
            ],
        )?;
        debug!("execution row created");
        Ok(())
    }

    #[instrument(skip(self, update), fields(execution_id = %id, status = %update.status))]
    fn update(&self, id: &ExecutionId, update: &ExecutionUpdate) -> Result<()> {
        let result_json = update
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let db = self.conn();
        let n = db.execute(
            "UPDATE task_executions
             SET status = ?1, result = ?2, error = ?3, retry_count = ?4,
                 finished_at = ?5, duration_ms = ?6
             WHERE id = ?7",
            rusqlite::params![
                update.status.as_str(),
                result_json,
                update.error,
                update.retry_count,
                update.finished_at.as_ref().map(fmt_ts),
                update.duration_ms.map(|d| d as i64),
                id.as_str(),
            ],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    fn find_many(
        &self,
        filter: &ExecutionFilter,
        page: Pagination,
        order: SortOrder,
    ) -> Result<Vec<ExecutionRecord>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(ref task) = filter.task_name {
            clauses.push("task_name = ?");
            args.push(Box::new(task.clone()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            args.push(Box::new(status.as_str()));
        }
        if let Some(source) = filter.trigger_source {
            clauses.push("trigger_source = ?");
            args.push(Box::new(source.as_str()));
        }
        if let Some(ref name) = filter.trigger_name {
            clauses.push("trigger_name = ?");
            args.push(Box::new(name.clone()));
        }
        if let Some(ref after) = filter.started_after {
            clauses.push("started_at >= ?");
            args.push(Box::new(fmt_ts(after)));
        }
        if let Some(ref before) = filter.started_before {
            clauses.push("started_at < ?");
            args.push(Box::new(fmt_ts(before)));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let order_sql = match order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM task_executions {where_sql}
             ORDER BY started_at {order_sql}, id {order_sql}
             LIMIT ? OFFSET ?"
        );
        args.push(Box::new(page.limit));
        args.push(Box::new(page.offset));

        let db = self.conn();
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            row_to_execution,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn find_unique(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>> {
        let db = self.conn();
        match db.query_row(
            &format!("SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE id = ?1"),
            [id.as_str()],
            row_to_execution,
        ) {
            Ok(r) => Ok(Some(r)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    fn mark_orphans_failed(&self) -> Result<usize> {
        let now = fmt_ts(&Utc::now());
        let db = self.conn();
        let n = db.execute(
            "UPDATE task_executions
             SET status = 'failed', error = ?1, finished_at = ?2
             WHERE status = 'running'",
            rusqlite::params![ORPHAN_ERROR, now],
        )?;
        if n > 0 {
            warn!(count = n, "orphaned executions marked failed");
        }
        Ok(n)
    }
}

impl TriggerStore for SqliteStore {
    fn list_triggers(&self) -> Result<Vec<TriggerRow>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map([], row_to_trigger)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get_trigger(&self, id: &str) -> Result<Option<TriggerRow>> {
        let db = self.conn();
        match db.query_row(
            &format!("SELECT {TRIGGER_COLUMNS} FROM triggers WHERE id = ?1"),
            [id],
            row_to_trigger,
        ) {
            Ok(r) => Ok(Some(r)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    #[instrument(skip(self, row), fields(trigger_id = %row.id))]
    fn insert_trigger(&self, row: &TriggerRow) -> Result<()> {
        let params_json = serde_json::to_string(&row.params)?;
        let db = self.conn();
        let n = db.execute(
            "INSERT OR IGNORE INTO triggers
             (id, name, task_name, cron, params, enabled, description, overlap,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                row.id,
                row.name,
                row.task_name,
                row.cron,
                params_json,
                row.enabled,
                row.description,
                row.overlap.as_str(),
                fmt_ts(&row.created_at),
                fmt_ts(&row.updated_at),
            ],
        )?;
        if n == 0 {
            return Err(StoreError::Conflict { id: row.id.clone() });
        }
        info!("trigger row inserted");
        Ok(())
    }

    #[instrument(skip(self, row), fields(trigger_id = %row.id))]
    fn update_trigger(&self, row: &TriggerRow) -> Result<()> {
        let params_json = serde_json::to_string(&row.params)?;
        let db = self.conn();
        let n = db.execute(
            "UPDATE triggers
             SET name = ?1, task_name = ?2, cron = ?3, params = ?4, enabled = ?5,
                 description = ?6, overlap = ?7, updated_at = ?8
             WHERE id = ?9",
            rusqlite::params![
                row.name,
                row.task_name,
                row.cron,
                params_json,
                row.enabled,
                row.description,
                row.overlap.as_str(),
                fmt_ts(&row.updated_at),
                row.id,
            ],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound { id: row.id.clone() });
        }
        Ok(())
    }

    fn delete_trigger(&self, id: &str) -> Result<()> {
        let db = self.conn();
        let n = db.execute("DELETE FROM triggers WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        info!(trigger_id = %id, "trigger row deleted");
        Ok(())
    }
}

// --- row mapping ------------------------------------------------------------

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    // Fixed width so lexical order in SQL equals chronological order.
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_enum<T: FromStr<Err = String>>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

fn parse_json(idx: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let source: String = row.get(2)?;
    let params: String = row.get(4)?;
    let status: String = row.get(5)?;
    let result: Option<String> = row.get(6)?;
    let started_at: String = row.get(10)?;
    let finished_at: Option<String> = row.get(11)?;
    let duration_ms: Option<i64> = row.get(12)?;

    Ok(ExecutionRecord {
        id: ExecutionId(row.get(0)?),
        task_name: row.get(1)?,
        trigger_source: parse_enum(2, &source)?,
        trigger_name: row.get(3)?,
        params: parse_json(4, &params)?,
        status: parse_enum::<ExecutionStatus>(5, &status)?,
        result: result.as_deref().map(|r| parse_json(6, r)).transpose()?,
        error: row.get(7)?,
        retry_count: row.get(8)?,
        max_retries: row.get(9)?,
        started_at: parse_ts(10, &started_at)?,
        finished_at: finished_at.as_deref().map(|f| parse_ts(11, f)).transpose()?,
        duration_ms: duration_ms.map(|d| d.max(0) as u64),
    })
}

fn row_to_trigger(row: &Row<'_>) -> rusqlite::Result<TriggerRow> {
    let params: String = row.get(4)?;
    let overlap: String = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok(TriggerRow {
        id: row.get(0)?,
        name: row.get(1)?,
        task_name: row.get(2)?,
        cron: row.get(3)?,
        params: parse_json(4, &params)?,
        enabled: row.get(5)?,
        description: row.get(6)?,
        overlap: parse_enum(7, &overlap)?,
        created_at: parse_ts(8, &created_at)?,
        updated_at: parse_ts(9, &updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use harvester_core::{OverlapPolicy, TriggerSource};
    use serde_json::json;

    fn new_execution(task: &str, source: TriggerSource, started_at: DateTime<Utc>) -> NewExecution {
        NewExecution {
            id: ExecutionId::new(),
            task_name: task.to_string(),
            trigger_source: source,
            trigger_name: None,
            params: json!({ "profile": "alice" }),
            status: ExecutionStatus::Running,
            max_retries: 2,
            started_at,
        }
    }

    fn trigger_row(id: &str) -> TriggerRow {
        let now = Utc::now();
        TriggerRow {
            id: id.to_string(),
            name: format!("trigger {id}"),
            task_name: "echo".to_string(),
            cron: "0 */5 * * * *".to_string(),
            params: json!({ "msg": "hi" }),
            enabled: true,
            description: None,
            overlap: OverlapPolicy::Allow,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn create_then_update_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let exec = new_execution("scrape", TriggerSource::Manual, Utc::now());
        store.create(&exec).unwrap();

        let finished = Utc::now();
        store
            .update(
                &exec.id,
                &ExecutionUpdate {
                    status: ExecutionStatus::Success,
                    result: Some(json!({ "items": 3 })),
                    error: None,
                    retry_count: 1,
                    finished_at: Some(finished),
                    duration_ms: Some(42),
                },
            )
            .unwrap();

        let row = store.find_unique(&exec.id).unwrap().expect("row exists");
        assert_eq!(row.status, ExecutionStatus::Success);
        assert_eq!(row.result, Some(json!({ "items": 3 })));
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.max_retries, 2);
        assert_eq!(row.duration_ms, Some(42));
        assert_eq!(row.params["profile"], "alice");
    }

    #[test]
    fn update_unknown_execution_is_not_found() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store
            .update(
                &ExecutionId::new(),
                &ExecutionUpdate {
                    status: ExecutionStatus::Failed,
                    result: None,
                    error: Some("boom".into()),
                    retry_count: 0,
                    finished_at: None,
                    duration_ms: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn orphans_are_reclassified_as_failed() {
        let store = SqliteStore::in_memory().unwrap();
        let orphan = new_execution("scrape", TriggerSource::Cron, Utc::now());
        let done = new_execution("scrape", TriggerSource::Cron, Utc::now());
        store.create(&orphan).unwrap();
        store.create(&done).unwrap();
        store
            .update(
                &done.id,
                &ExecutionUpdate {
                    status: ExecutionStatus::Success,
                    result: None,
                    error: None,
                    retry_count: 0,
                    finished_at: Some(Utc::now()),
                    duration_ms: Some(1),
                },
            )
            .unwrap();

        assert_eq!(store.mark_orphans_failed().unwrap(), 1);
        let row = store.find_unique(&orphan.id).unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Failed);
        assert_eq!(row.error.as_deref(), Some(ORPHAN_ERROR));
        assert!(row.finished_at.is_some());
        assert_eq!(
            store.find_unique(&done.id).unwrap().unwrap().status,
            ExecutionStatus::Success
        );
        assert_eq!(store.mark_orphans_failed().unwrap(), 0);
    }

    #[test]
    fn find_many_filters_orders_and_paginates() {
        let store = SqliteStore::in_memory().unwrap();
        let base = Utc::now() - Duration::hours(1);
        for i in 0..5 {
            let source = if i % 2 == 0 {
                TriggerSource::Cron
            } else {
                TriggerSource::Api
            };
            let mut exec = new_execution("scrape", source, base + Duration::minutes(i));
            if source == TriggerSource::Cron {
                exec.trigger_name = Some("every-minute".to_string());
            }
            store.create(&exec).unwrap();
        }
        store
            .create(&new_execution("other", TriggerSource::Manual, base))
            .unwrap();

        let all_scrape = store
            .find_many(
                &ExecutionFilter {
                    task_name: Some("scrape".into()),
                    ..Default::default()
                },
                Pagination::default(),
                SortOrder::Asc,
            )
            .unwrap();
        assert_eq!(all_scrape.len(), 5);
        assert!(all_scrape
            .windows(2)
            .all(|w| w[0].started_at <= w[1].started_at));

        let cron_only = store
            .find_many(
                &ExecutionFilter {
                    trigger_source: Some(TriggerSource::Cron),
                    trigger_name: Some("every-minute".into()),
                    ..Default::default()
                },
                Pagination::default(),
                SortOrder::Desc,
            )
            .unwrap();
        assert_eq!(cron_only.len(), 3);

        let windowed = store
            .find_many(
                &ExecutionFilter {
                    task_name: Some("scrape".into()),
                    started_after: Some(base + Duration::minutes(1)),
                    started_before: Some(base + Duration::minutes(3)),
                    ..Default::default()
                },
                Pagination::default(),
                SortOrder::Asc,
            )
            .unwrap();
        assert_eq!(windowed.len(), 2);

        let page = store
            .find_many(
                &ExecutionFilter::default(),
                Pagination {
                    limit: 2,
                    offset: 1,
                },
                SortOrder::Desc,
            )
            .unwrap();
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn trigger_crud() {
        let store = SqliteStore::in_memory().unwrap();
        let mut row = trigger_row("t1");
        store.insert_trigger(&row).unwrap();
        assert!(matches!(
            store.insert_trigger(&row).unwrap_err(),
            StoreError::Conflict { .. }
        ));

        row.cron = "0 0 * * * *".to_string();
        row.enabled = false;
        row.overlap = OverlapPolicy::Skip;
        store.update_trigger(&row).unwrap();
        let loaded = store.get_trigger("t1").unwrap().unwrap();
        assert_eq!(loaded.cron, "0 0 * * * *");
        assert!(!loaded.enabled);
        assert_eq!(loaded.overlap, OverlapPolicy::Skip);

        assert_eq!(store.list_triggers().unwrap().len(), 1);
        store.delete_trigger("t1").unwrap();
        assert!(store.get_trigger("t1").unwrap().is_none());
        assert!(matches!(
            store.delete_trigger("t1").unwrap_err(),
            StoreError::NotFound { .. }
        ));
        assert!(matches!(
            store.update_trigger(&row).unwrap_err(),
            StoreError::NotFound { .. }
        ));
    }
}
