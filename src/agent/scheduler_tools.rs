use anyhow::{Result, bail};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use super::tools::{Tool, ToolRegistry};
use crate::scheduler::TaskScheduler;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListTasksParams {}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateTaskParams {
    /// Task name, e.g. "Morning briefing".
    pub name: String,
    /// 5-field cron expression, e.g. "0 9 * * 1-5".
    pub cron: String,
    /// Message sent to the assistant when the task fires.
    pub message: String,
    /// Optional human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Whether to activate the task immediately (default true).
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DeleteTaskParams {
    /// Task id as shown by list_tasks.
    pub task_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ToggleTaskParams {
    pub task_id: String,
    /// true = enable, false = disable.
    pub enabled: bool,
}

pub struct ListTasks(pub Arc<TaskScheduler>);
pub struct CreateTask(pub Arc<TaskScheduler>);
pub struct DeleteTask(pub Arc<TaskScheduler>);
pub struct ToggleTask(pub Arc<TaskScheduler>);

/// Registers the scheduler management tools.
pub fn register(registry: &mut ToolRegistry, scheduler: &Arc<TaskScheduler>) {
    registry.register(ListTasks(scheduler.clone()));
    registry.register(CreateTask(scheduler.clone()));
    registry.register(DeleteTask(scheduler.clone()));
    registry.register(ToggleTask(scheduler.clone()));
}

fn new_task_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("task_{}", &hex[..8])
}

#[async_trait]
impl Tool for ListTasks {
    type Args = ListTasksParams;

    fn name(&self) -> &str {
        "list_tasks"
    }

    fn description(&self) -> &str {
        "Return the list of all scheduled tasks with their current status."
    }

    async fn call(&self, _args: ListTasksParams) -> Result<Value> {
        let tasks: Vec<Value> = self
            .0
            .tasks()
            .into_iter()
            .map(|t| {
                json!({
                    "task_id": t.task_id,
                    "name": t.name,
                    "cron": t.cron_expression,
                    "description": t.description,
                    "enabled": t.enabled,
                    "run_count": t.run_count,
                    "last_run": t.last_run,
                    "next_run": t.next_run,
                    "builtin": t.builtin,
                    "message": t.message.unwrap_or_default(),
                })
            })
            .collect();
        Ok(json!({"count": tasks.len(), "tasks": tasks}))
    }
}

#[async_trait]
impl Tool for CreateTask {
    type Args = CreateTaskParams;

    fn name(&self) -> &str {
        "create_task"
    }

    fn description(&self) -> &str {
        "Create a scheduled task that sends a message to the assistant on a cron schedule."
    }

    async fn call(&self, args: CreateTaskParams) -> Result<Value> {
        let task_id = new_task_id();
        let task = self.0.add_message_task(
            &task_id,
            &args.name,
            &args.cron,
            &args.message,
            args.description.as_deref().unwrap_or_default(),
            args.enabled.unwrap_or(true),
        )?;
        let when = task
            .next_run
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "not within the next 24 hours".to_string());
        Ok(json!({
            "status": "success",
            "task_id": task.task_id,
            "name": task.name,
            "cron": task.cron_expression,
            "next_run": task.next_run,
            "message": format!("Task '{}' created ({}), next run: {when}.", task.name, task.cron_expression),
        }))
    }
}

#[async_trait]
impl Tool for DeleteTask {
    type Args = DeleteTaskParams;

    fn name(&self) -> &str {
        "delete_task"
    }

    fn description(&self) -> &str {
        "Delete a scheduled task. Built-in system tasks (e.g. memory_trim) cannot be deleted."
    }

    async fn call(&self, args: DeleteTaskParams) -> Result<Value> {
        let Some(task) = self.0.get_task(&args.task_id) else {
            bail!("task '{}' not found", args.task_id);
        };
        if task.builtin {
            bail!("task '{}' is a built-in task and cannot be deleted", args.task_id);
        }
        self.0.remove_task(&args.task_id);
        Ok(json!({
            "status": "success",
            "task_id": args.task_id,
            "message": format!("Task '{}' deleted.", task.name),
        }))
    }
}

#[async_trait]
impl Tool for ToggleTask {
    type Args = ToggleTaskParams;

    fn name(&self) -> &str {
        "toggle_task"
    }

    fn description(&self) -> &str {
        "Enable or disable a scheduled task."
    }

    async fn call(&self, args: ToggleTaskParams) -> Result<Value> {
        if !self.0.set_enabled(&args.task_id, args.enabled) {
            bail!("task '{}' not found", args.task_id);
        }
        let state = if args.enabled { "enabled" } else { "disabled" };
        Ok(json!({
            "status": "success",
            "task_id": args.task_id,
            "enabled": args.enabled,
            "message": format!("Task '{}' {state}.", args.task_id),
        }))
    }
}
