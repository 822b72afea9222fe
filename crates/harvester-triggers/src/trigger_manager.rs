//! One live cron timer per enabled trigger, kept in step with the config.
//!
//! A timer is a spawned task that sleeps until the next fire time and then
//! hands the trigger's task to the executor without waiting for it. Timers
//! are never changed in place: a cron change stops the old timer and starts
//! a new one with a fresh timer id. Changes to anything else (name, task,
//! params, overlap policy) are picked up by the running timer on its next
//! fire.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use cron::Schedule;
use harvester_core::{CancelSignal, OverlapPolicy, TriggerSource};
use harvester_tasks::{ExecutionRequest, TaskExecutor};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::manager::{ConfigChangeEvent, ConfigListener, ConfigManager};
use crate::schedule;
use crate::schema::TriggerConfigEntry;

/// Running execution count per trigger id.
type InFlight = Arc<Mutex<HashMap<String, usize>>>;

/// What a timer runs when it fires. Shared with the timer task so it can be
/// refreshed without touching the timer.
#[derive(Debug, Clone, PartialEq)]
struct FireTarget {
    trigger_name: String,
    task_name: String,
    params: JsonValue,
    overlap: OverlapPolicy,
}

impl FireTarget {
    fn from_entry(entry: &TriggerConfigEntry) -> Self {
        Self {
            trigger_name: entry.config.name.clone(),
            task_name: entry.config.task_name.clone(),
            params: entry.config.params.clone(),
            overlap: entry.config.overlap,
        }
    }
}

struct LiveTimer {
    timer_id: String,
    cron: String,
    schedule: Schedule,
    target: Arc<RwLock<FireTarget>>,
    stop: CancelSignal,
    handle: JoinHandle<()>,
}

impl LiveTimer {
    fn halt(self) {
        self.stop.cancel();
        self.handle.abort();
    }
}

/// Public view of one live timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledTrigger {
    pub trigger_id: String,
    pub timer_id: String,
    pub cron: String,
    pub next_fire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TimerStats {
    pub live: usize,
    pub started: u64,
    pub stopped: u64,
}

/// What one reconcile pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    pub started: usize,
    pub stopped: usize,
    pub refreshed: usize,
}

pub struct CronTriggerManager {
    executor: Arc<TaskExecutor>,
    timers: Mutex<HashMap<String, LiveTimer>>,
    /// Executions in flight per trigger id, for `OverlapPolicy::Skip`.
    in_flight: InFlight,
    started: AtomicU64,
    stopped: AtomicU64,
}

impl CronTriggerManager {
    pub fn new(executor: Arc<TaskExecutor>) -> Self {
        Self {
            executor,
            timers: Mutex::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            started: AtomicU64::new(0),
            stopped: AtomicU64::new(0),
        }
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, HashMap<String, LiveTimer>> {
        self.timers.lock().expect("timer table poisoned")
    }

    /// Schedule every enabled trigger the manager currently holds and follow
    /// its changes from now on.
    pub fn initialize(self: &Arc<Self>, manager: &ConfigManager) -> ReconcileReport {
        manager.subscribe(Arc::clone(self) as Arc<dyn ConfigListener>);
        let report = self.reconcile(&manager.entries());
        info!(scheduled = report.started, "cron trigger manager initialized");
        report
    }

    /// Bring the live timers in line with `entries`.
    ///
    /// Stops happen before starts, so a trigger never has two live timers.
    pub fn reconcile(&self, entries: &[TriggerConfigEntry]) -> ReconcileReport {
        let mut desired: BTreeMap<&str, &TriggerConfigEntry> = BTreeMap::new();
        for entry in entries.iter().filter(|e| e.config.enabled) {
            desired.insert(entry.id(), entry);
        }

        let mut report = ReconcileReport::default();
        let mut timers = self.timers();

        let stale: Vec<String> = timers
            .iter()
            .filter(|(id, timer)| match desired.get(id.as_str()) {
                Some(entry) => entry.config.cron != timer.cron,
                None => true,
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(timer) = timers.remove(&id) {
                info!(trigger_id = %id, timer_id = %timer.timer_id, cron = %timer.cron, "stopping cron timer");
                timer.halt();
                self.stopped.fetch_add(1, Ordering::Relaxed);
                report.stopped += 1;
            }
        }

        for (id, entry) in desired {
            let target = FireTarget::from_entry(entry);
            if let Some(timer) = timers.get(id) {
                let mut current = timer.target.write().expect("fire target poisoned");
                if *current != target {
                    debug!(trigger_id = %id, "refreshing fire target");
                    *current = target;
                    report.refreshed += 1;
                }
                continue;
            }
            match self.start_timer(id, &entry.config.cron, target) {
                Some(timer) => {
                    timers.insert(id.to_string(), timer);
                    report.started += 1;
                }
                None => continue,
            }
        }

        if report != ReconcileReport::default() {
            info!(
                started = report.started,
                stopped = report.stopped,
                refreshed = report.refreshed,
                live = timers.len(),
                "cron schedule reconciled"
            );
        }
        report
    }

    fn start_timer(
        &self,
        trigger_id: &str,
        cron_expr: &str,
        target: FireTarget,
    ) -> Option<LiveTimer> {
        let schedule = match schedule::parse(cron_expr) {
            Ok(s) => s,
            Err(e) => {
                error!(trigger_id, error = %e, "cannot schedule trigger");
                return None;
            }
        };
        let timer_id = Uuid::new_v4().to_string();
        let target = Arc::new(RwLock::new(target));
        let stop = CancelSignal::new();

        let handle = tokio::spawn(run_timer(
            trigger_id.to_string(),
            timer_id.clone(),
            schedule.clone(),
            Arc::clone(&target),
            stop.clone(),
            Arc::clone(&self.executor),
            Arc::clone(&self.in_flight),
        ));

        self.started.fetch_add(1, Ordering::Relaxed);
        info!(trigger_id, %timer_id, cron = cron_expr, "cron timer started");
        Some(LiveTimer {
            timer_id,
            cron: cron_expr.to_string(),
            schedule,
            target,
            stop,
            handle,
        })
    }

    /// Live timers, ordered by trigger id.
    pub fn scheduled(&self) -> Vec<ScheduledTrigger> {
        let now = Utc::now();
        let mut list: Vec<ScheduledTrigger> = self
            .timers()
            .iter()
            .map(|(id, timer)| ScheduledTrigger {
                trigger_id: id.clone(),
                timer_id: timer.timer_id.clone(),
                cron: timer.cron.clone(),
                next_fire_at: schedule::next_fire(&timer.schedule, now),
            })
            .collect();
        list.sort_by(|a, b| a.trigger_id.cmp(&b.trigger_id));
        list
    }

    pub fn timer_stats(&self) -> TimerStats {
        TimerStats {
            live: self.timers().len(),
            started: self.started.load(Ordering::Relaxed),
            stopped: self.stopped.load(Ordering::Relaxed),
        }
    }

    /// Stop every live timer. In-flight executions are left to the executor.
    pub fn shutdown(&self) {
        let drained: Vec<(String, LiveTimer)> = self.timers().drain().collect();
        let count = drained.len();
        for (_, timer) in drained {
            timer.halt();
            self.stopped.fetch_add(1, Ordering::Relaxed);
        }
        info!(stopped = count, "cron trigger manager shut down");
    }
}

impl ConfigListener for CronTriggerManager {
    fn name(&self) -> &str {
        "cron-trigger-manager"
    }

    fn on_change(
        &self,
        event: &ConfigChangeEvent,
        current: &[TriggerConfigEntry],
    ) -> anyhow::Result<()> {
        debug!(?event, "config change received");
        self.reconcile(current);
        Ok(())
    }
}

async fn run_timer(
    trigger_id: String,
    timer_id: String,
    schedule: Schedule,
    target: Arc<RwLock<FireTarget>>,
    stop: CancelSignal,
    executor: Arc<TaskExecutor>,
    in_flight: InFlight,
) {
    let mut last_fire: Option<DateTime<Utc>> = None;
    loop {
        let now = Utc::now();
        let from = match last_fire {
            Some(last) if last > now => last,
            _ => now,
        };
        let Some(next) = schedule::next_fire(&schedule, from) else {
            warn!(%trigger_id, %timer_id, "cron expression has no upcoming fire time");
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        last_fire = Some(next);

        let target = target.read().expect("fire target poisoned").clone();
        dispatch(&trigger_id, target, &executor, &in_flight);
    }
    debug!(%trigger_id, %timer_id, "cron timer loop exited");
}

/// Start the trigger's task without waiting for it.
fn dispatch(
    trigger_id: &str,
    target: FireTarget,
    executor: &Arc<TaskExecutor>,
    in_flight: &InFlight,
) {
    {
        let mut running = in_flight.lock().expect("in-flight table poisoned");
        let count = running.entry(trigger_id.to_string()).or_insert(0);
        if *count > 0 && target.overlap == OverlapPolicy::Skip {
            info!(trigger_id, task = %target.task_name, "previous run still in flight, skipping fire");
            return;
        }
        *count += 1;
    }

    let task_name = target.task_name.clone();
    let req = ExecutionRequest::new(target.task_name)
        .params(target.params)
        .source(TriggerSource::Cron)
        .trigger_name(target.trigger_name);
    let executor = Arc::clone(executor);
    let in_flight = Arc::clone(in_flight);
    let trigger_id = trigger_id.to_string();

    tokio::spawn(async move {
        match executor.execute(req).await {
            Ok(result) if result.success => {
                debug!(%trigger_id, execution_id = %result.execution_id, "cron run finished")
            }
            Ok(result) => warn!(
                %trigger_id,
                execution_id = %result.execution_id,
                error = result.error.as_deref().unwrap_or(""),
                "cron run did not succeed"
            ),
            Err(e) => error!(%trigger_id, task = %task_name, error = %e, "cron run could not start"),
        }
        let mut running = in_flight.lock().expect("in-flight table poisoned");
        if let Some(count) = running.get_mut(&trigger_id) {
            *count -= 1;
            if *count == 0 {
                running.remove(&trigger_id);
            }
        }
    });
}
