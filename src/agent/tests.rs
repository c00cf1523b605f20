use crate::agent::tool_loop::FORCE_ANSWER_PROMPT;
use crate::agent::{
    AbortFlags, LoopEvent, LoopOutcome, Tool, ToolCallLoop, ToolRegistry, auto_stop_text,
};
use crate::config::{FallbackConfig, ToolLoopConfig};
use crate::llm::{ChatMessage, ModelBackend, ModelTurn, ToolCall, TurnRequest, Usage};
use crate::agent::scheduler_tools;
use crate::resilience::{ClassifiedError, ErrorKind, ProviderFallbackChain};
use crate::scheduler::TaskScheduler;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Scripted = Result<ModelTurn, ClassifiedError>;

/// Backend that replays a fixed list of rounds, whatever the provider.
struct ScriptedBackend {
    script: Mutex<VecDeque<Scripted>>,
    calls: AtomicUsize,
    cost_per_round: Option<f64>,
}

impl ScriptedBackend {
    fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            cost_per_round: None,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn complete(&self, _provider: &str, _req: &TurnRequest) -> Result<ModelTurn> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(turn)) => Ok(turn),
            Some(Err(e)) => Err(e.into()),
            None => Err(anyhow!("script exhausted")),
        }
    }

    fn cost_for(&self, _provider: &str, _usage: &Usage) -> Option<f64> {
        self.cost_per_round
    }
}

/// Tool returning a fixed JSON value and counting its invocations.
struct FixedTool {
    name: &'static str,
    result: Value,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for FixedTool {
    type Args = Value;

    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "test tool"
    }

    async fn call(&self, _args: Value) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.clone())
    }
}

struct FailingTool {
    name: &'static str,
    message: &'static str,
}

#[async_trait]
impl Tool for FailingTool {
    type Args = Value;

    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "always fails"
    }

    async fn call(&self, _args: Value) -> Result<Value> {
        Err(anyhow!(self.message))
    }
}

/// Tool that asks for the session to be aborted while it runs.
struct AbortingTool(Arc<AbortFlags>);

#[async_trait]
impl Tool for AbortingTool {
    type Args = Value;

    fn name(&self) -> &str {
        "get_entity_details"
    }

    fn description(&self) -> &str {
        "requests an abort"
    }

    async fn call(&self, _args: Value) -> Result<Value> {
        self.0.request("s1");
        Ok(json!({"state": "on"}))
    }
}

fn text(t: &str) -> Scripted {
    Ok(ModelTurn {
        text: t.to_string(),
        tool_calls: vec![],
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        },
    })
}

fn tools(t: &str, calls: &[(&str, &str, &str)]) -> Scripted {
    Ok(ModelTurn {
        text: t.to_string(),
        tool_calls: calls
            .iter()
            .map(|(id, name, args)| ToolCall::new(*id, *name, *args))
            .collect(),
        usage: Usage::default(),
    })
}

fn failure(kind: ErrorKind, msg: &str) -> Scripted {
    Err(ClassifiedError::new(kind, "p", msg))
}

fn fixed(name: &'static str, result: Value) -> (FixedTool, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    (
        FixedTool {
            name,
            result,
            calls: calls.clone(),
        },
        calls,
    )
}

fn fast_cfg() -> ToolLoopConfig {
    ToolLoopConfig {
        pacing_unit_ms: 0,
        rate_limit_wait_ms: 1,
        ..Default::default()
    }
}

struct Harness {
    tool_loop: ToolCallLoop,
    backend: Arc<ScriptedBackend>,
    chain: Arc<ProviderFallbackChain>,
    aborts: Arc<AbortFlags>,
}

fn harness(backend: ScriptedBackend, registry: ToolRegistry, cfg: ToolLoopConfig) -> Harness {
    harness_with_aborts(backend, registry, cfg, Arc::new(AbortFlags::new()))
}

fn harness_with_aborts(
    backend: ScriptedBackend,
    registry: ToolRegistry,
    cfg: ToolLoopConfig,
    aborts: Arc<AbortFlags>,
) -> Harness {
    let chain = Arc::new(ProviderFallbackChain::new(
        vec!["p".to_string()],
        &FallbackConfig {
            max_attempts: 3,
            backoff_base_ms: 1,
        },
    ));
    let backend = Arc::new(backend);
    let tool_loop = ToolCallLoop::new(
        chain.clone(),
        backend.clone(),
        Arc::new(registry),
        aborts.clone(),
        cfg,
    );
    Harness {
        tool_loop,
        backend,
        chain,
        aborts,
    }
}

fn history() -> Vec<ChatMessage> {
    vec![ChatMessage::user("what lights are on?")]
}

#[tokio::test]
async fn plain_answer_ends_after_one_round() {
    let h = harness(
        ScriptedBackend::new(vec![text("Nothing is on.")]),
        ToolRegistry::new(),
        fast_cfg(),
    );
    let mut messages = history();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let report = h.tool_loop.run("s1", "sys", &mut messages, None, Some(&tx)).await;

    assert_eq!(report.outcome, LoopOutcome::Answered);
    assert_eq!(report.full_text, "Nothing is on.");
    assert_eq!(report.rounds, 1);
    assert_eq!(report.provider.as_deref(), Some("p"));
    assert!(!report.used_tools);
    assert_eq!(report.usage.output_tokens, 5);
    assert_eq!(messages.last(), Some(&ChatMessage::assistant("Nothing is on.")));

    drop(tx);
    let mut events = Vec::new();
    while let Some(e) = rx.recv().await {
        events.push(e);
    }
    assert!(events.contains(&LoopEvent::Clear));
    assert_eq!(
        events.last(),
        Some(&LoopEvent::Done {
            full_text: "Nothing is on.".into(),
            outcome: LoopOutcome::Answered,
        })
    );
}

#[tokio::test]
async fn repeated_read_tool_is_blocked_and_answer_forced() {
    let (get_entities, executed) = fixed("get_entities", json!([{"entity_id": "light.kitchen"}]));
    let mut registry = ToolRegistry::new();
    registry.register(get_entities);

    let h = harness(
        ScriptedBackend::new(vec![
            tools("", &[("c1", "get_entities", "{}")]),
            tools("", &[("c2", "get_entities", r#"{"domain":"light"}"#)]),
            text("The kitchen light is on."),
        ]),
        registry,
        fast_cfg(),
    );
    let mut messages = history();
    let report = h.tool_loop.run("s1", "sys", &mut messages, None, None).await;

    assert_eq!(report.outcome, LoopOutcome::Answered);
    assert_eq!(report.full_text, "The kitchen light is on.");
    assert_eq!(report.rounds, 3);
    assert_eq!(report.blocked_redundant, 1);
    assert_eq!(executed.load(Ordering::SeqCst), 1);

    let skipped = messages
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("c2"))
        .and_then(|m| m.content.clone())
        .unwrap();
    assert!(skipped.contains("Skipped: get_entities already called"));
    assert!(
        messages
            .iter()
            .any(|m| m.role == "user" && m.content.as_deref() == Some(FORCE_ANSWER_PROMPT))
    );
}

#[tokio::test]
async fn successful_write_auto_stops_without_another_model_call() {
    let (create, _) = fixed(
        "create_automation",
        json!({"status": "success", "message": "Automation 'Night lights' created."}),
    );
    let mut registry = ToolRegistry::new();
    registry.register(create);

    let h = harness(
        ScriptedBackend::new(vec![
            tools("creating", &[("c1", "create_automation", r#"{"alias":"x"}"#)]),
            text("should never be requested"),
        ]),
        registry,
        fast_cfg(),
    );
    let mut messages = history();
    let report = h.tool_loop.run("s1", "sys", &mut messages, None, None).await;

    assert_eq!(report.outcome, LoopOutcome::AutoStopped);
    assert_eq!(report.full_text, "Automation 'Night lights' created.");
    assert_eq!(h.backend.calls(), 1);
    assert_eq!(
        messages.last(),
        Some(&ChatMessage::assistant("Automation 'Night lights' created."))
    );
}

#[tokio::test]
async fn draft_dashboard_does_not_auto_stop() {
    let (draft, _) = fixed(
        "create_html_dashboard",
        json!({"status": "draft_started", "url": "/local/dash.html"}),
    );
    let mut registry = ToolRegistry::new();
    registry.register(draft);

    let h = harness(
        ScriptedBackend::new(vec![
            tools("", &[("c1", "create_html_dashboard", "{}")]),
            text("Draft started, send the rest."),
        ]),
        registry,
        fast_cfg(),
    );
    let mut messages = history();
    let report = h.tool_loop.run("s1", "sys", &mut messages, None, None).await;
    assert_eq!(report.outcome, LoopOutcome::Answered);
    assert_eq!(h.backend.calls(), 2);
}

#[test]
fn auto_stop_rules() {
    assert!(auto_stop_text("create_dashboard", r#"{"status":"success","views_count":0}"#).is_none());
    assert!(auto_stop_text("create_dashboard", r#"{"status":"success","views_count":2}"#).is_some());
    assert!(auto_stop_text("update_script", r#"{"status":"error"}"#).is_none());
    assert!(auto_stop_text("update_script", "not json").is_none());

    let text = auto_stop_text("write_config_file", r#"{"url":"/config/a.yaml"}"#).unwrap();
    assert!(text.starts_with("Write config file completed successfully."));
    assert!(text.ends_with("/config/a.yaml"));
}

#[tokio::test]
async fn pending_abort_stops_before_any_call_and_resets() {
    let h = harness(
        ScriptedBackend::new(vec![text("unused")]),
        ToolRegistry::new(),
        fast_cfg(),
    );
    h.aborts.request("s1");
    let mut messages = history();
    let report = h.tool_loop.run("s1", "sys", &mut messages, None, None).await;

    assert_eq!(report.outcome, LoopOutcome::Aborted);
    assert_eq!(h.backend.calls(), 0);
    assert!(!h.aborts.is_requested("s1"));

    // next turn of the same session runs normally
    let report = h.tool_loop.run("s1", "sys", &mut messages, None, None).await;
    assert_eq!(report.outcome, LoopOutcome::Answered);
}

#[tokio::test]
async fn abort_during_a_round_takes_effect_at_the_next_boundary() {
    let aborts = Arc::new(AbortFlags::new());
    let mut registry = ToolRegistry::new();
    registry.register(AbortingTool(aborts.clone()));

    let h = harness_with_aborts(
        ScriptedBackend::new(vec![
            tools("", &[("c1", "get_entity_details", "{}")]),
            text("unused"),
        ]),
        registry,
        fast_cfg(),
        aborts,
    );
    let mut messages = history();
    let report = h.tool_loop.run("s1", "sys", &mut messages, None, None).await;

    assert_eq!(report.outcome, LoopOutcome::Aborted);
    assert_eq!(h.backend.calls(), 1);
    assert_eq!(report.rounds, 1);
}

#[tokio::test]
async fn round_budget_exhaustion_keeps_partial_text() {
    let (details, executed) = fixed("get_entity_details", json!({"state": "on"}));
    let mut registry = ToolRegistry::new();
    registry.register(details);

    let cfg = ToolLoopConfig {
        max_rounds: 2,
        ..fast_cfg()
    };
    let h = harness(
        ScriptedBackend::new(vec![
            tools("Checking the first light", &[("c1", "get_entity_details", r#"{"entity_id":"light.a"}"#)]),
            tools("Checking the second light", &[("c2", "get_entity_details", r#"{"entity_id":"light.b"}"#)]),
            text("unused"),
        ]),
        registry,
        cfg,
    );
    let mut messages = history();
    let report = h.tool_loop.run("s1", "sys", &mut messages, None, None).await;

    assert_eq!(report.outcome, LoopOutcome::Exhausted);
    assert_eq!(report.full_text, "Checking the second light");
    assert_eq!(report.rounds, 2);
    assert_eq!(executed.load(Ordering::SeqCst), 2);
    assert_eq!(h.backend.calls(), 2);
}

#[tokio::test]
async fn large_results_are_truncated_per_tool_class() {
    let (small, _) = fixed("get_history_summary", Value::String("x".repeat(9000)));
    let (large, _) = fixed("read_config_file", Value::String("y".repeat(9000)));
    let mut registry = ToolRegistry::new();
    registry.register(small);
    registry.register(large);

    let h = harness(
        ScriptedBackend::new(vec![
            tools(
                "",
                &[
                    ("c1", "get_history_summary", "{}"),
                    ("c2", "read_config_file", r#"{"filename":"configuration.yaml"}"#),
                ],
            ),
            text("done"),
        ]),
        registry,
        fast_cfg(),
    );
    let mut messages = history();
    h.tool_loop.run("s1", "sys", &mut messages, None, None).await;

    let result_of = |id: &str| {
        messages
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some(id))
            .and_then(|m| m.content.clone())
            .unwrap()
    };
    let small = result_of("c1");
    assert!(small.ends_with("[TRUNCATED - 9000 chars total]"));
    assert!(small.starts_with(&"x".repeat(8000)));
    assert_eq!(result_of("c2"), "y".repeat(9000));
}

#[tokio::test]
async fn rate_limit_exhaustion_waits_and_retries_the_round() {
    let h = harness(
        ScriptedBackend::new(vec![
            failure(ErrorKind::RateLimit, "429 too many requests"),
            failure(ErrorKind::RateLimit, "429 too many requests"),
            failure(ErrorKind::RateLimit, "429 too many requests"),
            text("Back online."),
        ]),
        ToolRegistry::new(),
        fast_cfg(),
    );
    let mut messages = history();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let report = h.tool_loop.run("s1", "sys", &mut messages, None, Some(&tx)).await;

    assert_eq!(report.outcome, LoopOutcome::Answered);
    assert_eq!(report.full_text, "Back online.");
    assert_eq!(report.rounds, 2);
    assert_eq!(h.backend.calls(), 4);

    drop(tx);
    let mut saw_wait = false;
    while let Some(e) = rx.recv().await {
        if let LoopEvent::Status(s) = e {
            saw_wait |= s.contains("Rate limit");
        }
    }
    assert!(saw_wait);
}

#[tokio::test]
async fn non_rate_limit_exhaustion_fails_with_error_event() {
    let h = harness(
        ScriptedBackend::new(vec![failure(ErrorKind::InvalidRequest, "400 bad request")]),
        ToolRegistry::new(),
        fast_cfg(),
    );
    let mut messages = history();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let report = h.tool_loop.run("s1", "sys", &mut messages, None, Some(&tx)).await;

    assert_eq!(report.outcome, LoopOutcome::Failed);
    assert_eq!(h.backend.calls(), 1);
    assert_eq!(messages.len(), 1);

    drop(tx);
    let mut errors = Vec::new();
    while let Some(e) = rx.recv().await {
        if let LoopEvent::Error(msg) = e {
            errors.push(msg);
        }
    }
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("All providers failed"));
}

#[tokio::test]
async fn tool_errors_are_returned_to_the_model() {
    let mut registry = ToolRegistry::new();
    registry.register(FailingTool {
        name: "get_entity_history",
        message: "recorder unavailable",
    });
    let h = harness(
        ScriptedBackend::new(vec![
            tools("", &[("c1", "get_entity_history", "{}")]),
            text("History is unavailable right now."),
        ]),
        registry,
        fast_cfg(),
    );
    let mut messages = history();
    let report = h.tool_loop.run("s1", "sys", &mut messages, None, None).await;

    assert_eq!(report.outcome, LoopOutcome::Answered);
    let payload: Value = serde_json::from_str(
        messages
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("c1"))
            .and_then(|m| m.content.as_deref())
            .unwrap(),
    )
    .unwrap();
    assert_eq!(
        payload["error"],
        "Tool 'get_entity_history' failed: recorder unavailable"
    );
}

#[tokio::test]
async fn auth_failure_in_a_tool_stops_the_loop() {
    let mut registry = ToolRegistry::new();
    registry.register(FailingTool {
        name: "get_entity_history",
        message: "401 Unauthorized",
    });
    let h = harness(
        ScriptedBackend::new(vec![
            tools("", &[("c1", "get_entity_history", "{}")]),
            text("unused"),
        ]),
        registry,
        fast_cfg(),
    );
    let mut messages = history();
    let report = h.tool_loop.run("s1", "sys", &mut messages, None, None).await;
    assert_eq!(report.outcome, LoopOutcome::Failed);
    assert_eq!(h.backend.calls(), 1);
}

#[tokio::test]
async fn rejected_cron_goes_back_to_the_model() {
    let scheduler = Arc::new(TaskScheduler::new(Duration::from_secs(60)));
    let mut registry = ToolRegistry::new();
    scheduler_tools::register(&mut registry, &scheduler);
    let h = harness(
        ScriptedBackend::new(vec![
            tools(
                "",
                &[(
                    "c1",
                    "create_task",
                    r#"{"name":"Odd","cron":"403 * * * *","message":"ping"}"#,
                )],
            ),
            text("That schedule is not valid, the minute must be 0-59."),
        ]),
        registry,
        fast_cfg(),
    );
    let mut messages = history();
    let report = h.tool_loop.run("s1", "sys", &mut messages, None, None).await;

    assert_eq!(report.outcome, LoopOutcome::Answered);
    assert_eq!(h.backend.calls(), 2);
    let payload: Value = serde_json::from_str(
        messages
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("c1"))
            .and_then(|m| m.content.as_deref())
            .unwrap(),
    )
    .unwrap();
    let error = payload["error"].as_str().unwrap();
    assert!(error.starts_with("Tool 'create_task' failed"));
    assert!(error.contains("403"));
    assert!(scheduler.tasks().iter().all(|t| t.builtin));
}

#[test]
fn pacing_grows_one_unit_per_round_up_to_six() {
    let h = harness(
        ScriptedBackend::new(vec![]),
        ToolRegistry::new(),
        ToolLoopConfig {
            pacing_unit_ms: 1000,
            ..Default::default()
        },
    );
    let delays: Vec<Duration> = (1..=5).map(|r| h.tool_loop.pacing_delay(r)).collect();
    assert_eq!(
        delays,
        [4000, 5000, 6000, 6000, 6000].map(Duration::from_millis)
    );
}

#[tokio::test]
async fn identical_calls_in_a_round_run_once() {
    let (details, executed) = fixed("get_entity_details", json!({"state": "on"}));
    let mut registry = ToolRegistry::new();
    registry.register(details);

    let h = harness(
        ScriptedBackend::new(vec![
            tools(
                "",
                &[
                    ("c1", "get_entity_details", r#"{"entity_id":"light.a"}"#),
                    ("c2", "get_entity_details", r#"{"entity_id":"light.a"}"#),
                ],
            ),
            text("It is on."),
        ]),
        registry,
        fast_cfg(),
    );
    let mut messages = history();
    h.tool_loop.run("s1", "sys", &mut messages, None, None).await;

    assert_eq!(executed.load(Ordering::SeqCst), 1);
    let second: Value = serde_json::from_str(
        messages
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("c2"))
            .and_then(|m| m.content.as_deref())
            .unwrap(),
    )
    .unwrap();
    assert_eq!(second["cached"], true);
    assert_eq!(second["state"], "on");
}

#[tokio::test]
async fn round_cost_is_recorded_on_the_chain() {
    let mut backend = ScriptedBackend::new(vec![text("ok")]);
    backend.cost_per_round = Some(0.25);
    let h = harness(backend, ToolRegistry::new(), fast_cfg());
    let mut messages = history();
    let report = h.tool_loop.run("s1", "sys", &mut messages, None, None).await;

    assert!((report.cost_usd - 0.25).abs() < 1e-9);
    let stats = h.chain.stats();
    assert!((stats.total_cost_usd - 0.25).abs() < 1e-9);
    assert_eq!(stats.total_calls, 1);
}
