//! Cron-driven task scheduler.
//!
//! One background loop polls at a fixed interval and fires due tasks
//! sequentially. Tasks either run a code-bound [`TaskAction`] or hand their
//! `message` to a [`MessageSink`], which feeds it back into the assistant as
//! a synthetic user turn.

pub mod cron;
pub mod error;
pub mod store;
pub mod task;
#[cfg(test)]
pub mod tests;

pub use cron::CronExpression;
pub use error::{CronError, SchedulerError};
pub use store::TaskStore;
pub use task::{MessageSink, ScheduledTask, TaskAction, TaskExecution, TaskRecord, action_fn};

use crate::utils::lock_or_recover;
use chrono::{Local, NaiveDateTime};
use futures::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const HISTORY_CAP: usize = 100;
const RESULT_PREVIEW_CHARS: usize = 200;
const MESSAGE_PREVIEW_CHARS: usize = 60;
const REFIRE_GUARD_SECS: i64 = 60;

#[derive(Default)]
struct SchedulerState {
    tasks: BTreeMap<String, ScheduledTask>,
    actions: HashMap<String, Arc<dyn TaskAction>>,
    history: HashMap<String, VecDeque<TaskExecution>>,
    last_fired: HashMap<String, NaiveDateTime>,
}

impl SchedulerState {
    fn records(&self) -> Vec<TaskRecord> {
        self.tasks
            .values()
            .filter(|t| t.is_persistent())
            .map(ScheduledTask::to_record)
            .collect()
    }
}

struct LoopControl {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub name: String,
    pub cron: String,
    pub enabled: bool,
    pub builtin: bool,
    pub runs: u64,
    pub errors: u64,
    pub last_run: Option<NaiveDateTime>,
    pub next_run: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub total_tasks: usize,
    pub enabled_tasks: usize,
    pub total_runs: u64,
    pub total_errors: u64,
    /// Percentage of executions that succeeded.
    pub success_rate: f64,
    pub tasks: Vec<TaskSummary>,
}

pub struct TaskScheduler {
    state: Mutex<SchedulerState>,
    store: Option<TaskStore>,
    sink: Option<Arc<dyn MessageSink>>,
    check_interval: Duration,
    running: AtomicBool,
    control: Mutex<Option<LoopControl>>,
}

impl TaskScheduler {
    pub fn new(check_interval: Duration) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            store: None,
            sink: None,
            check_interval,
            running: AtomicBool::new(false),
            control: Mutex::new(None),
        }
    }

    pub fn with_store(mut self, store: TaskStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_message_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Registers a task driven by code. Replaces any task with the same id.
    pub fn register_task(
        &self,
        task_id: &str,
        name: &str,
        cron_expression: &str,
        description: &str,
        builtin: bool,
        action: Arc<dyn TaskAction>,
    ) -> Result<(), SchedulerError> {
        let cron = CronExpression::parse(cron_expression)?;
        let mut task = ScheduledTask::new(
            task_id.to_string(),
            name.to_string(),
            cron,
            description.to_string(),
            now(),
        );
        task.builtin = builtin;

        let mut state = lock_or_recover(&self.state);
        state.tasks.insert(task_id.to_string(), task);
        state.actions.insert(task_id.to_string(), action);
        state.history.insert(task_id.to_string(), VecDeque::new());
        drop(state);

        info!(task_id, name, cron = cron_expression, builtin, "task registered");
        Ok(())
    }

    /// Adds a persisted task that delivers `message` when it fires.
    pub fn add_message_task(
        &self,
        task_id: &str,
        name: &str,
        cron_expression: &str,
        message: &str,
        description: &str,
        enabled: bool,
    ) -> Result<ScheduledTask, SchedulerError> {
        let cron = CronExpression::parse(cron_expression)?;
        let mut task = ScheduledTask::new(
            task_id.to_string(),
            name.to_string(),
            cron,
            description.to_string(),
            now(),
        );
        task.enabled = enabled;
        task.message = Some(message.to_string());

        let records = {
            let mut state = lock_or_recover(&self.state);
            if state.tasks.get(task_id).is_some_and(|t| t.builtin) {
                return Err(SchedulerError::Builtin(task_id.to_string()));
            }
            state.tasks.insert(task_id.to_string(), task.clone());
            state.actions.remove(task_id);
            state.history.insert(task_id.to_string(), VecDeque::new());
            state.records()
        };
        self.persist(&records);

        info!(task_id, name, cron = cron_expression, "message task added");
        Ok(task)
    }

    /// Removes a task. Builtin and unknown ids return `false`.
    pub fn remove_task(&self, task_id: &str) -> bool {
        let records = {
            let mut state = lock_or_recover(&self.state);
            match state.tasks.get(task_id) {
                None => return false,
                Some(t) if t.builtin => {
                    warn!(task_id, "cannot remove built-in task");
                    return false;
                }
                Some(_) => {}
            }
            state.tasks.remove(task_id);
            state.actions.remove(task_id);
            state.history.remove(task_id);
            state.last_fired.remove(task_id);
            state.records()
        };
        self.persist(&records);
        info!(task_id, "task removed");
        true
    }

    pub fn enable_task(&self, task_id: &str) -> bool {
        self.set_enabled(task_id, true)
    }

    pub fn disable_task(&self, task_id: &str) -> bool {
        self.set_enabled(task_id, false)
    }

    /// Returns `false` when no such task exists.
    pub fn set_enabled(&self, task_id: &str, enabled: bool) -> bool {
        let (persistent, records) = {
            let mut state = lock_or_recover(&self.state);
            let Some(task) = state.tasks.get_mut(task_id) else {
                return false;
            };
            task.enabled = enabled;
            if enabled {
                task.next_run = task.cron.next_after(now());
            }
            let persistent = task.is_persistent();
            (persistent, state.records())
        };
        if persistent {
            self.persist(&records);
        }
        info!(task_id, enabled, "task toggled");
        true
    }

    pub fn get_task(&self, task_id: &str) -> Option<ScheduledTask> {
        lock_or_recover(&self.state).tasks.get(task_id).cloned()
    }

    pub fn tasks(&self) -> Vec<ScheduledTask> {
        lock_or_recover(&self.state).tasks.values().cloned().collect()
    }

    /// Most recent executions, oldest first.
    pub fn task_history(&self, task_id: &str, limit: usize) -> Vec<TaskExecution> {
        let state = lock_or_recover(&self.state);
        let Some(history) = state.history.get(task_id) else {
            return Vec::new();
        };
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Writes the current message tasks to the store.
    pub fn save_tasks(&self) -> Result<(), SchedulerError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let records = lock_or_recover(&self.state).records();
        store.save(&records)
    }

    fn persist(&self, records: &[TaskRecord]) {
        if let Some(store) = &self.store
            && let Err(e) = store.save(records)
        {
            warn!(error = %e, "could not save tasks");
        }
    }

    /// Loads persisted message tasks. Ids already known in memory are kept
    /// as they are; records with a bad cron expression are skipped.
    pub fn load_tasks(&self) -> Result<usize, SchedulerError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let records = store.load()?;
        let now = now();
        let mut loaded = 0;
        let mut state = lock_or_recover(&self.state);
        for record in records {
            if record.task_id.is_empty() || state.tasks.contains_key(&record.task_id) {
                continue;
            }
            let cron = match CronExpression::parse(&record.cron_expression) {
                Ok(cron) => cron,
                Err(e) => {
                    warn!(task_id = %record.task_id, error = %e, "skipping stored task");
                    continue;
                }
            };
            let name = if record.name.is_empty() {
                record.task_id.clone()
            } else {
                record.name
            };
            let mut task = ScheduledTask::new(
                record.task_id.clone(),
                name,
                cron,
                record.description,
                now,
            );
            task.enabled = record.enabled;
            task.message = Some(record.message).filter(|m| !m.is_empty());
            task.created_at = record.created_at;
            task.run_count = record.run_count;
            task.error_count = record.error_count;
            state.history.insert(record.task_id.clone(), VecDeque::new());
            state.tasks.insert(record.task_id, task);
            loaded += 1;
        }
        drop(state);
        if loaded > 0 {
            info!(loaded, path = %store.path().display(), "loaded scheduled tasks");
        }
        Ok(loaded)
    }

    pub async fn tick(&self) -> usize {
        self.tick_at(now()).await
    }

    /// Fires every enabled task whose cron matches `now` and that has not
    /// fired in the last minute. Tasks run one after another. Returns the
    /// number of tasks fired.
    pub async fn tick_at(&self, now: NaiveDateTime) -> usize {
        let due: Vec<(String, Option<Arc<dyn TaskAction>>, Option<String>)> = {
            let mut state = lock_or_recover(&self.state);
            let SchedulerState {
                tasks,
                actions,
                last_fired,
                ..
            } = &mut *state;
            let mut due = Vec::new();
            for (id, task) in tasks.iter() {
                if !task.enabled {
                    continue;
                }
                if let Some(last) = last_fired.get(id)
                    && now.signed_duration_since(*last).num_seconds() < REFIRE_GUARD_SECS
                {
                    continue;
                }
                if task.cron.matches(&now) {
                    last_fired.insert(id.clone(), now);
                    due.push((id.clone(), actions.get(id).cloned(), task.message.clone()));
                }
            }
            due
        };

        let fired = due.len();
        for (task_id, action, message) in due {
            self.execute(&task_id, action, message, now).await;
        }
        fired
    }

    async fn execute(
        &self,
        task_id: &str,
        action: Option<Arc<dyn TaskAction>>,
        message: Option<String>,
        now: NaiveDateTime,
    ) {
        info!(task_id, "executing task");
        let started = Instant::now();

        let outcome: anyhow::Result<Option<String>> =
            match (action, message.as_deref(), self.sink.as_ref()) {
                (Some(action), _, _) => AssertUnwindSafe(action.run())
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("task panicked"))),
                (None, Some(msg), Some(sink)) if !msg.is_empty() => {
                    sink.deliver(task_id, msg).map(|()| {
                        let head: String = msg.chars().take(MESSAGE_PREVIEW_CHARS).collect();
                        Some(format!("Message sent: {head}"))
                    })
                }
                _ => Ok(Some("no-op (no callback or message)".to_string())),
            };

        let duration_seconds = started.elapsed().as_secs_f64();
        let mut execution = TaskExecution {
            task_id: task_id.to_string(),
            executed_at: now,
            duration_seconds,
            success: outcome.is_ok(),
            error: None,
            result: None,
        };

        let records = {
            let mut state = lock_or_recover(&self.state);
            let Some(task) = state.tasks.get_mut(task_id) else {
                // removed while running
                return;
            };
            match outcome {
                Ok(result) => {
                    task.run_count += 1;
                    execution.result = result
                        .filter(|r| !r.is_empty())
                        .map(|r| r.chars().take(RESULT_PREVIEW_CHARS).collect());
                    debug!(task_id, duration_seconds, "task completed");
                }
                Err(e) => {
                    task.error_count += 1;
                    error!(task_id, error = %e, "task failed");
                    execution.error = Some(format!("{e:#}"));
                }
            }
            task.last_run = Some(now);
            task.next_run = task.cron.next_after(now);
            let persistent = task.is_persistent();

            let history = state.history.entry(task_id.to_string()).or_default();
            history.push_back(execution);
            while history.len() > HISTORY_CAP {
                history.pop_front();
            }
            persistent.then(|| state.records())
        };
        if let Some(records) = records {
            self.persist(&records);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the tick loop. Returns `false` if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("scheduler already running");
            return false;
        }
        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { this.run_loop(token).await });
        *lock_or_recover(&self.control) = Some(LoopControl { cancel, handle });
        info!(interval_secs = self.check_interval.as_secs(), "scheduler started");
        true
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        loop {
            let fired = self.tick().await;
            if fired > 0 {
                debug!(fired, "scheduler tick");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.check_interval) => {}
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Cancels the loop and waits for the current tick to finish.
    pub async fn stop(&self) {
        let control = lock_or_recover(&self.control).take();
        if let Some(LoopControl { cancel, handle }) = control {
            cancel.cancel();
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler loop ended abnormally");
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("scheduler stopped");
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = lock_or_recover(&self.state);
        let total_runs: u64 = state.tasks.values().map(|t| t.run_count).sum();
        let total_errors: u64 = state.tasks.values().map(|t| t.error_count).sum();
        let attempts = total_runs + total_errors;
        let success_rate = if attempts == 0 {
            0.0
        } else {
            total_runs as f64 / attempts as f64 * 100.0
        };
        SchedulerStats {
            running: self.is_running(),
            total_tasks: state.tasks.len(),
            enabled_tasks: state.tasks.values().filter(|t| t.enabled).count(),
            total_runs,
            total_errors,
            success_rate,
            tasks: state
                .tasks
                .values()
                .map(|t| TaskSummary {
                    id: t.task_id.clone(),
                    name: t.name.clone(),
                    cron: t.cron_expression.clone(),
                    enabled: t.enabled,
                    builtin: t.builtin,
                    runs: t.run_count,
                    errors: t.error_count,
                    last_run: t.last_run,
                    next_run: t.next_run,
                })
                .collect(),
        }
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}
