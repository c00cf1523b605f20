use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use super::abort::AbortFlags;
use super::optimizer::plan_round;
use super::tools::ToolRegistry;
use crate::config::ToolLoopConfig;
use crate::llm::{ChatMessage, ModelBackend, ModelTurn, ToolCall, TurnRequest, Usage};
use crate::resilience::{ErrorKind, FallbackOutcome, ProviderFallbackChain, classify_error};
use crate::scheduler::{CronError, SchedulerError};
use crate::utils::{preview, truncate_with_marker};

/// Informational tools that are answered at most once per run.
pub const REDUNDANT_READ_TOOLS: &[&str] = &[
    "get_automations",
    "get_scripts",
    "get_dashboards",
    "get_dashboard_config",
    "read_config_file",
    "list_config_files",
    "get_frontend_resources",
    "search_entities",
    "get_entity_state",
    "get_entities",
    "list_tasks",
];

/// Mutating tools whose success ends the run without another model call.
pub const WRITE_TOOLS: &[&str] = &[
    "update_automation",
    "update_script",
    "update_dashboard_card",
    "create_automation",
    "create_script",
    "create_dashboard",
    "update_dashboard",
    "create_html_dashboard",
    "write_config_file",
    "create_task",
    "delete_task",
    "toggle_task",
];

/// Tools allowed the larger result limit.
pub const LARGE_RESULT_TOOLS: &[&str] = &[
    "read_config_file",
    "get_entity_details",
    "get_entity_history",
];

pub const FORCE_ANSWER_PROMPT: &str = "You already have all the data needed. Respond to the user now with the results. Do not call any more tools.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopOutcome {
    /// The model produced a final text answer.
    Answered,
    /// Cancelled through the session's abort flag.
    Aborted,
    /// A write tool succeeded and its result became the answer.
    AutoStopped,
    /// `max_rounds` ran out; whatever text was produced is returned.
    Exhausted,
    /// Every provider failed, or a tool hit an unrecoverable error.
    Failed,
}

impl LoopOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopOutcome::Answered => "answered",
            LoopOutcome::Aborted => "aborted",
            LoopOutcome::AutoStopped => "auto-stopped",
            LoopOutcome::Exhausted => "exhausted",
            LoopOutcome::Failed => "failed",
        }
    }
}

/// Progress notifications for a front end.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    Status(String),
    Tool { name: String, description: String },
    /// Drop any intermediate tool badges; the answer follows.
    Clear,
    Token(String),
    Error(String),
    Done {
        full_text: String,
        outcome: LoopOutcome,
    },
}

#[derive(Debug, Clone)]
pub struct LoopReport {
    pub outcome: LoopOutcome,
    pub full_text: String,
    /// Provider that served the last successful round.
    pub provider: Option<String>,
    pub rounds: usize,
    pub blocked_redundant: usize,
    /// Whether any tool was executed during the run.
    pub used_tools: bool,
    pub usage: Usage,
    pub cost_usd: f64,
}

struct ToolOutput {
    call: ToolCall,
    content: String,
    blocked: bool,
}

enum RoundEnd {
    Continue,
    Stop(LoopOutcome),
}

/// Drives model rounds until an answer, an auto-stop, an abort, a failure,
/// or the round budget.
pub struct ToolCallLoop {
    chain: Arc<ProviderFallbackChain>,
    backend: Arc<dyn ModelBackend>,
    tools: Arc<ToolRegistry>,
    aborts: Arc<AbortFlags>,
    cfg: ToolLoopConfig,
}

struct RunState<'a> {
    session_id: &'a str,
    events: Option<&'a UnboundedSender<LoopEvent>>,
    called: HashSet<String>,
    full_text: String,
    last_text: String,
    provider: Option<String>,
    blocked_redundant: usize,
    used_tools: bool,
    usage: Usage,
    cost_usd: f64,
}

impl RunState<'_> {
    fn emit(&self, event: LoopEvent) {
        if let Some(tx) = self.events {
            let _ = tx.send(event);
        }
    }
}

/// Typed scheduler errors are bad arguments from the model, whatever numbers
/// their messages quote.
fn tool_error_kind(err: &anyhow::Error) -> ErrorKind {
    if err.downcast_ref::<SchedulerError>().is_some() || err.downcast_ref::<CronError>().is_some() {
        return ErrorKind::InvalidRequest;
    }
    classify_error(err, "tool").kind
}

impl ToolCallLoop {
    pub fn new(
        chain: Arc<ProviderFallbackChain>,
        backend: Arc<dyn ModelBackend>,
        tools: Arc<ToolRegistry>,
        aborts: Arc<AbortFlags>,
        cfg: ToolLoopConfig,
    ) -> Self {
        Self {
            chain,
            backend,
            tools,
            aborts,
            cfg,
        }
    }

    pub(super) fn pacing_delay(&self, round: usize) -> Duration {
        let units = (3 + round as u64).min(6);
        Duration::from_millis(units * self.cfg.pacing_unit_ms)
    }

    /// Runs one conversational turn. `messages` must already end with the
    /// user's message; assistant and tool messages are appended as the run
    /// proceeds, and the final answer is appended when there is one.
    pub async fn run(
        &self,
        session_id: &str,
        system: &str,
        messages: &mut Vec<ChatMessage>,
        intent: Option<&str>,
        events: Option<&UnboundedSender<LoopEvent>>,
    ) -> LoopReport {
        let mut st = RunState {
            session_id,
            events,
            called: HashSet::new(),
            full_text: String::new(),
            last_text: String::new(),
            provider: None,
            blocked_redundant: 0,
            used_tools: false,
            usage: Usage::default(),
            cost_usd: 0.0,
        };
        let defs = self.tools.defs();
        let mut rate_limit_waits = 0usize;
        let mut round = 0usize;

        let outcome = loop {
            if round >= self.cfg.max_rounds {
                warn!(session_id, rounds = round, "round budget exhausted");
                st.full_text = st.last_text.clone();
                break LoopOutcome::Exhausted;
            }
            if self.aborted(&st) {
                break LoopOutcome::Aborted;
            }
            if round > 0 {
                let delay = self.pacing_delay(round);
                info!(session_id, round = round + 1, delay_ms = delay.as_millis() as u64, "pacing before next round");
                st.emit(LoopEvent::Status(format!(
                    "Waiting {}s to avoid rate limits...",
                    delay.as_secs()
                )));
                tokio::time::sleep(delay).await;
                if self.aborted(&st) {
                    break LoopOutcome::Aborted;
                }
            }

            let req = TurnRequest {
                system: system.to_string(),
                messages: messages.clone(),
                tools: defs.clone(),
                intent: intent.map(str::to_string),
            };
            st.emit(LoopEvent::Status("Request sent...".to_string()));
            let backend = self.backend.clone();
            let outcome = self
                .chain
                .execute_with_fallback(|provider| {
                    let backend = backend.clone();
                    let req = req.clone();
                    async move { backend.complete(&provider, &req).await }
                })
                .await;
            round += 1;

            let (turn, provider) = match outcome {
                FallbackOutcome::Served { value, provider } => (value, provider),
                FallbackOutcome::Exhausted { last_error } => {
                    let rate_limited = last_error
                        .as_ref()
                        .is_some_and(|e| e.kind == ErrorKind::RateLimit);
                    if rate_limited && rate_limit_waits < self.cfg.max_rate_limit_waits {
                        rate_limit_waits += 1;
                        warn!(session_id, round, "rate limited on every provider, waiting before retrying the round");
                        st.emit(LoopEvent::Status(
                            "Rate limit reached, waiting before retrying...".to_string(),
                        ));
                        tokio::time::sleep(Duration::from_millis(self.cfg.rate_limit_wait_ms))
                            .await;
                        continue;
                    }
                    let detail = last_error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "no providers configured".to_string());
                    error!(session_id, error = %detail, "all providers failed");
                    st.emit(LoopEvent::Error(format!("All providers failed: {detail}")));
                    break LoopOutcome::Failed;
                }
            };
            self.account(&mut st, &turn, &provider);

            if turn.tool_calls.is_empty() {
                debug!(session_id, round, "no tool calls, final answer");
                st.full_text = turn.text;
                break LoopOutcome::Answered;
            }

            match self.tool_round(&mut st, messages, turn).await {
                RoundEnd::Continue => {}
                RoundEnd::Stop(outcome) => break outcome,
            }
        };

        if matches!(
            outcome,
            LoopOutcome::Answered | LoopOutcome::AutoStopped | LoopOutcome::Exhausted
        ) {
            if !st.full_text.is_empty() {
                messages.push(ChatMessage::assistant(st.full_text.clone()));
            }
            st.emit(LoopEvent::Clear);
            st.emit(LoopEvent::Token(st.full_text.clone()));
        }
        info!(
            session_id,
            outcome = outcome.as_str(),
            rounds = round,
            blocked_redundant = st.blocked_redundant,
            input_tokens = st.usage.input_tokens,
            output_tokens = st.usage.output_tokens,
            "tool loop finished"
        );
        st.emit(LoopEvent::Done {
            full_text: st.full_text.clone(),
            outcome,
        });
        LoopReport {
            outcome,
            full_text: st.full_text,
            provider: st.provider,
            rounds: round,
            blocked_redundant: st.blocked_redundant,
            used_tools: st.used_tools,
            usage: st.usage,
            cost_usd: st.cost_usd,
        }
    }

    fn aborted(&self, st: &RunState<'_>) -> bool {
        if self.aborts.take(st.session_id) {
            info!(session_id = st.session_id, "run aborted by user");
            st.emit(LoopEvent::Error("Cancelled by user".to_string()));
            return true;
        }
        false
    }

    fn account(&self, st: &mut RunState<'_>, turn: &ModelTurn, provider: &str) {
        st.usage.add(&turn.usage);
        if let Some(cost) = self.backend.cost_for(provider, &turn.usage) {
            self.chain.record_cost(provider, cost);
            st.cost_usd += cost;
        }
        st.provider = Some(provider.to_string());
        if !turn.text.is_empty() {
            st.last_text = turn.text.clone();
        }
    }

    async fn tool_round(
        &self,
        st: &mut RunState<'_>,
        messages: &mut Vec<ChatMessage>,
        turn: ModelTurn,
    ) -> RoundEnd {
        info!(session_id = st.session_id, tools = turn.tool_calls.len(), "tool calls received");
        st.emit(LoopEvent::Status("Actions received...".to_string()));
        let calls = turn.tool_calls.clone();
        messages.push(ChatMessage::assistant_tool_calls(
            Some(turn.text),
            turn.tool_calls,
        ));

        let plan = plan_round(&calls);
        let mut outputs: Vec<ToolOutput> = Vec::with_capacity(plan.len());
        let mut fatal: Option<String> = None;

        for planned in &plan {
            let call = &planned.call;
            let name = call.name();
            // every planned call pushes exactly one output, so plan and
            // outputs share indices
            if let Some(first) = planned.duplicate_of {
                let content = mark_cached(&outputs[first].content);
                let blocked = outputs[first].blocked;
                outputs.push(ToolOutput {
                    call: call.clone(),
                    content,
                    blocked,
                });
                continue;
            }
            if REDUNDANT_READ_TOOLS.contains(&name) && st.called.contains(name) {
                warn!(session_id = st.session_id, tool = name, "blocked redundant tool call");
                st.blocked_redundant += 1;
                outputs.push(ToolOutput {
                    call: call.clone(),
                    content: json!({"note": format!(
                        "Skipped: {name} already called. Use the data you already have. Respond to the user NOW."
                    )})
                    .to_string(),
                    blocked: true,
                });
                continue;
            }

            let args = call.arguments_json();
            st.emit(LoopEvent::Tool {
                name: name.to_string(),
                description: describe_call(name, &args),
            });
            info!(session_id = st.session_id, tool = name, args = %args, "executing tool");
            st.used_tools = true;
            let content = match self.tools.execute(name, args).await {
                Ok(result) => result,
                Err(err) => {
                    let kind = tool_error_kind(&err);
                    error!(tool = name, kind = %kind, error = %format!("{err:#}"), "tool execution failed");
                    if kind == ErrorKind::AuthFailed && fatal.is_none() {
                        fatal = Some(format!("Tool '{name}' failed: {err:#}"));
                    }
                    json!({"error": format!("Tool '{name}' failed: {err:#}")}).to_string()
                }
            };
            st.called.insert(name.to_string());
            let limit = if LARGE_RESULT_TOOLS.contains(&name) {
                self.cfg.max_large_result_chars
            } else {
                self.cfg.max_result_chars
            };
            let content = truncate_with_marker(&content, limit);
            debug!(tool = name, chars = content.len(), result = %preview(&content, 300), "tool result");
            outputs.push(ToolOutput {
                call: call.clone(),
                content,
                blocked: false,
            });
        }

        // results go back in the order the model asked for them
        for call in &calls {
            if let Some(out) = outputs.iter().find(|o| o.call.id == call.id) {
                messages.push(ChatMessage::tool_result(
                    call.id.clone().unwrap_or_default(),
                    out.content.clone(),
                ));
            }
        }

        if let Some(msg) = fatal {
            st.emit(LoopEvent::Error(msg));
            return RoundEnd::Stop(LoopOutcome::Failed);
        }

        if outputs.iter().all(|o| o.blocked) {
            info!(session_id = st.session_id, "all tool calls were redundant, forcing final response");
            messages.push(ChatMessage::user(FORCE_ANSWER_PROMPT));
            return RoundEnd::Continue;
        }

        for call in &calls {
            if !WRITE_TOOLS.contains(&call.name()) {
                continue;
            }
            let Some(out) = outputs.iter().find(|o| o.call.id == call.id) else {
                continue;
            };
            if let Some(text) = auto_stop_text(call.name(), &out.content) {
                info!(session_id = st.session_id, tool = call.name(), "write tool succeeded, auto-stopping");
                st.full_text = text;
                return RoundEnd::Stop(LoopOutcome::AutoStopped);
            }
        }
        RoundEnd::Continue
    }
}

fn mark_cached(content: &str) -> String {
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(mut map)) => {
            map.insert("cached".to_string(), Value::Bool(true));
            Value::Object(map).to_string()
        }
        _ => content.to_string(),
    }
}

fn describe_call(name: &str, args: &Value) -> String {
    let label = name.replace('_', " ");
    ["filename", "entity_id", "automation_id", "task_id"]
        .iter()
        .find_map(|k| args.get(*k).and_then(Value::as_str))
        .map_or(label.clone(), |target| format!("{label}: {target}"))
}

/// Final text for a successful write result, or `None` when the run should
/// go on (failure, draft dashboards, empty dashboards).
pub fn auto_stop_text(tool: &str, content: &str) -> Option<String> {
    let data: Value = serde_json::from_str(content).ok()?;
    let status = data.get("status").and_then(Value::as_str);
    let url = data.get("url").filter(|u| !u.is_null());
    if status != Some("success") && url.is_none() {
        return None;
    }
    if tool == "create_html_dashboard" && matches!(status, Some("draft_started" | "draft_appended"))
    {
        debug!(status, "auto-stop skipped for draft dashboard");
        return None;
    }
    if tool == "create_dashboard" && data.get("views_count").and_then(Value::as_u64) == Some(0) {
        debug!("auto-stop skipped for dashboard without views");
        return None;
    }
    Some(write_confirmation(tool, &data))
}

fn write_confirmation(tool: &str, data: &Value) -> String {
    let mut text = match data.get("message").and_then(Value::as_str) {
        Some(msg) if !msg.is_empty() => msg.to_string(),
        _ => {
            let mut label = tool.replace('_', " ");
            if let Some(first) = label.get_mut(0..1) {
                first.make_ascii_uppercase();
            }
            format!("{label} completed successfully.")
        }
    };
    if let Some(url) = data.get("url").and_then(Value::as_str) {
        text.push_str(&format!("\n\n{url}"));
    }
    text
}
