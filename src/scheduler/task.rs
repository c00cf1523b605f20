use super::cron::CronExpression;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTask {
    pub task_id: String,
    pub name: String,
    pub cron_expression: String,
    pub description: String,
    pub enabled: bool,
    pub created_at: NaiveDateTime,
    pub last_run: Option<NaiveDateTime>,
    pub next_run: Option<NaiveDateTime>,
    pub run_count: u64,
    pub error_count: u64,
    /// Text delivered to the assistant when the task fires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub builtin: bool,
    #[serde(skip)]
    pub(crate) cron: CronExpression,
}

impl ScheduledTask {
    pub(crate) fn new(
        task_id: String,
        name: String,
        cron: CronExpression,
        description: String,
        now: NaiveDateTime,
    ) -> Self {
        Self {
            next_run: cron.next_after(now),
            task_id,
            name,
            cron_expression: cron.to_string(),
            description,
            enabled: true,
            created_at: now,
            last_run: None,
            run_count: 0,
            error_count: 0,
            message: None,
            builtin: false,
            cron,
        }
    }

    /// Message tasks are the only ones written to disk.
    pub fn is_persistent(&self) -> bool {
        !self.builtin && self.message.as_deref().is_some_and(|m| !m.is_empty())
    }

    pub(crate) fn to_record(&self) -> TaskRecord {
        TaskRecord {
            task_id: self.task_id.clone(),
            name: self.name.clone(),
            cron_expression: self.cron_expression.clone(),
            description: self.description.clone(),
            enabled: self.enabled,
            message: self.message.clone().unwrap_or_default(),
            created_at: self.created_at,
            run_count: self.run_count,
            error_count: self.error_count,
        }
    }
}

fn default_true() -> bool {
    true
}

fn now_local() -> NaiveDateTime {
    Local::now().naive_local()
}

/// On-disk shape of a message task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cron_expression: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default = "now_local")]
    pub created_at: NaiveDateTime,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub error_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskExecution {
    pub task_id: String,
    pub executed_at: NaiveDateTime,
    pub duration_seconds: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// Code-bound work for a task.
#[async_trait]
pub trait TaskAction: Send + Sync {
    async fn run(&self) -> Result<Option<String>>;
}

struct FnAction<F>(F);

#[async_trait]
impl<F> TaskAction for FnAction<F>
where
    F: Fn() -> Result<Option<String>> + Send + Sync,
{
    async fn run(&self) -> Result<Option<String>> {
        (self.0)()
    }
}

/// Wraps a synchronous closure as a [`TaskAction`].
pub fn action_fn<F>(f: F) -> Arc<dyn TaskAction>
where
    F: Fn() -> Result<Option<String>> + Send + Sync + 'static,
{
    Arc::new(FnAction(f))
}

/// Receives the text of message tasks as they fire.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, task_id: &str, message: &str) -> Result<()>;
}

impl MessageSink for tokio::sync::mpsc::UnboundedSender<(String, String)> {
    fn deliver(&self, task_id: &str, message: &str) -> Result<()> {
        self.send((task_id.to_string(), message.to_string()))
            .map_err(|_| anyhow::anyhow!("message receiver closed"))
    }
}
