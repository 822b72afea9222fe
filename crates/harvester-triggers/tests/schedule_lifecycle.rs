// Trigger config flowing from providers through the manager into live timers
// and executions.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use harvester_core::config::ExecutorConfig;
use harvester_core::{CancelSignal, ExecutionStatus, OverlapPolicy, TriggerSource};
use harvester_store::{
    ExecutionFilter, ExecutionStore, Pagination, SortOrder, SqliteStore, TriggerRow, TriggerStore,
};
use harvester_tasks::{
    PersistenceMiddleware, TaskError, TaskExecutor, TaskHandler, TaskOptions, TaskRegistry,
};
use harvester_triggers::{
    derive_static_id, ConfigLoader, ConfigManager, ConfigProvider, CronTriggerManager,
    FileProvider, InlineProvider, NewTrigger, ReloadOutcome, StoreProvider, TriggerConfigSource,
    TriggerError, TriggerService,
};
use serde_json::{json, Value as JsonValue};

/// Provider whose records the test rewrites between reloads.
struct Editable {
    records: Mutex<Vec<JsonValue>>,
}

impl Editable {
    fn new(records: Vec<JsonValue>) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(records),
        })
    }

    fn set(&self, records: Vec<JsonValue>) {
        *self.records.lock().unwrap() = records;
    }
}

#[async_trait]
impl ConfigProvider for Editable {
    fn name(&self) -> &str {
        "editable"
    }

    async fn load(&self) -> harvester_triggers::Result<Vec<TriggerConfigSource>> {
        let records = self.records.lock().unwrap().clone();
        InlineProvider::new("editable", records).load().await
    }
}

fn trigger(name: &str, task: &str, cron: &str) -> JsonValue {
    json!({ "name": name, "taskName": task, "cron": cron })
}

fn executor() -> Arc<TaskExecutor> {
    let mut registry = TaskRegistry::new();
    let echo: Arc<dyn TaskHandler> =
        Arc::new(|params: JsonValue, _s: CancelSignal| async move { Ok::<_, TaskError>(params) });
    registry
        .register("echo", echo, TaskOptions::default())
        .unwrap();
    Arc::new(TaskExecutor::new(
        Arc::new(registry),
        &ExecutorConfig::default(),
    ))
}

async fn wired(provider: Arc<Editable>) -> (Arc<ConfigManager>, Arc<CronTriggerManager>) {
    let manager = Arc::new(ConfigManager::new(
        ConfigLoader::new().with_provider(provider),
    ));
    manager.reload().await.unwrap();
    let crons = Arc::new(CronTriggerManager::new(executor()));
    crons.initialize(&manager);
    (manager, crons)
}

#[tokio::test]
async fn unchanged_reload_touches_no_timer() {
    let provider = Editable::new(vec![
        trigger("nightly", "echo", "0 3 * * *"),
        trigger("hourly", "echo", "0 * * * *"),
    ]);
    let (manager, crons) = wired(provider.clone()).await;
    let before = crons.scheduled();
    let stats = crons.timer_stats();
    assert_eq!(stats.started, 2);

    // Same content, reloaded twice.
    assert_eq!(manager.reload().await.unwrap(), ReloadOutcome::Unchanged);
    provider.set(vec![
        trigger("hourly", "echo", "0 * * * *"),
        trigger("nightly", "echo", "0 3 * * *"),
    ]);
    assert_eq!(manager.reload().await.unwrap(), ReloadOutcome::Unchanged);

    assert_eq!(crons.timer_stats(), stats);
    assert_eq!(crons.scheduled(), before);
    crons.shutdown();
}

#[tokio::test]
async fn cron_change_replaces_exactly_one_timer() {
    let provider = Editable::new(vec![
        trigger("a", "echo", "0 3 * * *"),
        trigger("b", "echo", "0 4 * * *"),
        trigger("c", "echo", "0 5 * * *"),
    ]);
    let (manager, crons) = wired(provider.clone()).await;
    let before = crons.scheduled();

    provider.set(vec![
        trigger("a", "echo", "0 3 * * *"),
        trigger("b", "echo", "30 4 * * *"),
        trigger("c", "echo", "0 5 * * *"),
    ]);
    assert!(matches!(
        manager.reload().await.unwrap(),
        ReloadOutcome::Applied { triggers: 3 }
    ));

    let after = crons.scheduled();
    let b_id = derive_static_id("b");
    for (old, new) in before.iter().zip(after.iter()) {
        assert_eq!(old.trigger_id, new.trigger_id);
        if old.trigger_id == b_id {
            assert_ne!(old.timer_id, new.timer_id);
            assert_eq!(new.cron, "0 30 4 * * *");
        } else {
            assert_eq!(old.timer_id, new.timer_id);
        }
    }
    let stats = crons.timer_stats();
    assert_eq!((stats.started, stats.stopped, stats.live), (4, 1, 3));
    crons.shutdown();
}

#[tokio::test]
async fn same_task_triggers_are_independent() {
    let provider = Editable::new(vec![
        trigger("fast", "echo", "*/5 * * * *"),
        trigger("slow", "echo", "0 */2 * * *"),
    ]);
    let (manager, crons) = wired(provider.clone()).await;
    let slow_id = derive_static_id("slow");
    let slow_before = crons
        .scheduled()
        .into_iter()
        .find(|s| s.trigger_id == slow_id)
        .unwrap();
    assert_eq!(crons.scheduled().len(), 2);

    manager.delete(&derive_static_id("fast")).unwrap();

    let remaining = crons.scheduled();
    assert_eq!(remaining, vec![slow_before]);
    crons.shutdown();
}

#[tokio::test]
async fn file_and_store_ids_collide() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let now = Utc::now();
    store
        .insert_trigger(&TriggerRow {
            id: derive_static_id("nightly"),
            name: "nightly copy".into(),
            task_name: "echo".into(),
            cron: "0 3 * * *".into(),
            params: json!({}),
            enabled: true,
            description: None,
            overlap: OverlapPolicy::Allow,
            created_at: now,
            updated_at: now,
        })
        .unwrap();

    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        "[[triggers]]\nname = \"nightly\"\ntask_name = \"echo\"\ncron = \"0 3 * * *\""
    )
    .unwrap();

    let loader = ConfigLoader::new()
        .with_provider(Arc::new(FileProvider::new(file.path())))
        .with_provider(Arc::new(StoreProvider::new(store)));
    let manager = ConfigManager::new(loader);

    match manager.reload().await {
        Err(TriggerError::IdConflict { id, first, second }) => {
            assert_eq!(id, derive_static_id("nightly"));
            assert_eq!(first, "file");
            assert_eq!(second, "database");
        }
        other => panic!("expected an id conflict, got {other:?}"),
    }
    assert!(manager.entries().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fired_trigger_lands_in_history() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let executor = executor();
    executor.use_middleware(Arc::new(PersistenceMiddleware::new(store.clone())));

    let manager = Arc::new(ConfigManager::new(
        ConfigLoader::new().with_provider(Arc::new(StoreProvider::new(store.clone()))),
    ));
    manager.reload().await.unwrap();
    let crons = Arc::new(CronTriggerManager::new(Arc::clone(&executor)));
    crons.initialize(&manager);

    let service = TriggerService::new(store.clone(), Arc::clone(&manager));
    let row = service
        .create(NewTrigger {
            name: "every second".into(),
            task_name: "echo".into(),
            cron: "* * * * * *".into(),
            params: Some(json!({ "msg": "tick" })),
            enabled: true,
            description: None,
            overlap: OverlapPolicy::Skip,
        })
        .unwrap();
    assert_eq!(crons.scheduled().len(), 1);

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    service.toggle(&row.id, false).unwrap();
    assert!(crons.scheduled().is_empty());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let history = store
        .find_many(
            &ExecutionFilter {
                trigger_source: Some(TriggerSource::Cron),
                ..Default::default()
            },
            Pagination::default(),
            SortOrder::Asc,
        )
        .unwrap();
    assert!(!history.is_empty());
    for record in &history {
        assert_eq!(record.task_name, "echo");
        assert_eq!(record.trigger_name.as_deref(), Some("every second"));
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.result, Some(json!({ "msg": "tick" })));
    }
    crons.shutdown();
}
