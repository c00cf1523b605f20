//! The conversational service: semantic cache in front of the tool loop,
//! per-session memory behind it, and the builtin maintenance tasks.

pub mod memory;

pub use memory::ConversationMemory;

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::agent::{AbortFlags, LoopEvent, LoopOutcome, LoopReport, ToolCallLoop, ToolRegistry};
use crate::cache::{PromptCacheManager, SemanticCache};
use crate::config::AppConfig;
use crate::llm::{ChatMessage, ModelBackend};
use crate::resilience::ProviderFallbackChain;
use crate::scheduler::{TaskScheduler, action_fn};
use crate::utils::preview;

pub const MEMORY_TRIM_TASK: &str = "memory_trim";
pub const CACHE_SWEEP_TASK: &str = "cache_sweep";

/// Session id used for turns triggered by a scheduled task.
pub fn scheduled_session_id(task_id: &str) -> String {
    format!("task:{task_id}")
}

#[derive(Debug, Clone)]
pub enum ReplySource {
    /// Answered from the semantic cache without a model call.
    Cache { similarity: f64 },
    Model(LoopReport),
}

#[derive(Debug, Clone)]
pub struct TurnReply {
    pub text: String,
    pub source: ReplySource,
}

impl TurnReply {
    pub fn outcome(&self) -> LoopOutcome {
        match &self.source {
            ReplySource::Cache { .. } => LoopOutcome::Answered,
            ReplySource::Model(report) => report.outcome,
        }
    }
}

pub struct Assistant {
    system_prompt: String,
    tool_loop: ToolCallLoop,
    chain: Arc<ProviderFallbackChain>,
    scheduler: Arc<TaskScheduler>,
    semantic_cache: Arc<SemanticCache>,
    semantic_enabled: bool,
    prompt_cache: Arc<PromptCacheManager>,
    memory: Arc<ConversationMemory>,
    aborts: Arc<AbortFlags>,
}

impl Assistant {
    /// Wires the service together and registers the scheduler tools and the
    /// builtin maintenance tasks on `scheduler`.
    pub fn new(
        cfg: &AppConfig,
        backend: Arc<dyn ModelBackend>,
        scheduler: Arc<TaskScheduler>,
        prompt_cache: Arc<PromptCacheManager>,
    ) -> Result<Self> {
        let chain = Arc::new(ProviderFallbackChain::new(
            cfg.provider_order.clone(),
            &cfg.fallback,
        ));
        let mut registry = ToolRegistry::new();
        crate::agent::scheduler_tools::register(&mut registry, &scheduler);
        let aborts = Arc::new(AbortFlags::new());
        let tool_loop = ToolCallLoop::new(
            chain.clone(),
            backend,
            Arc::new(registry),
            aborts.clone(),
            cfg.tool_loop.clone(),
        );
        let semantic_cache = Arc::new(SemanticCache::from_config(&cfg.cache));
        let memory = Arc::new(ConversationMemory::new());

        let trim_memory = memory.clone();
        let max_messages = cfg.memory.max_messages;
        scheduler.register_task(
            MEMORY_TRIM_TASK,
            "Trim conversation memory",
            "0 * * * *",
            "Keeps each in-memory conversation within the configured size",
            true,
            action_fn(move || {
                let dropped = trim_memory.trim_all(max_messages);
                Ok(Some(format!("dropped {dropped} messages")))
            }),
        )?;
        let sweep_cache = semantic_cache.clone();
        scheduler.register_task(
            CACHE_SWEEP_TASK,
            "Sweep semantic cache",
            "30 * * * *",
            "Drops expired semantic cache entries",
            true,
            action_fn(move || {
                let purged = sweep_cache.purge_expired();
                Ok(Some(format!("purged {purged} entries")))
            }),
        )?;

        let mut system_prompt = cfg.system_prompt.clone();
        if !cfg.language.is_empty() && cfg.language != "en" {
            system_prompt.push_str(&format!(
                "\n\nAlways answer in the user's language ({}).",
                cfg.language
            ));
        }

        Ok(Self {
            system_prompt,
            tool_loop,
            chain,
            scheduler,
            semantic_cache,
            semantic_enabled: cfg.cache.semantic_enabled,
            prompt_cache,
            memory,
            aborts,
        })
    }

    pub fn chain(&self) -> &Arc<ProviderFallbackChain> {
        &self.chain
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn semantic_cache(&self) -> &Arc<SemanticCache> {
        &self.semantic_cache
    }

    pub fn prompt_cache(&self) -> &Arc<PromptCacheManager> {
        &self.prompt_cache
    }

    pub fn memory(&self) -> &Arc<ConversationMemory> {
        &self.memory
    }

    pub fn aborts(&self) -> &Arc<AbortFlags> {
        &self.aborts
    }

    /// One user turn. Pure chat questions seen before are answered from the
    /// semantic cache; everything else goes through the tool loop.
    pub async fn handle_turn(
        &self,
        session_id: &str,
        text: &str,
        intent: Option<&str>,
        events: Option<&UnboundedSender<LoopEvent>>,
    ) -> TurnReply {
        self.turn(session_id, text, intent, events, self.semantic_enabled)
            .await
    }

    /// A scheduled task's message entering as a synthetic user turn. Never
    /// served from or stored in the semantic cache.
    pub async fn handle_scheduled(
        &self,
        task_id: &str,
        message: &str,
        events: Option<&UnboundedSender<LoopEvent>>,
    ) -> TurnReply {
        info!(task_id, message = %preview(message, 60), "scheduled message turn");
        self.turn(&scheduled_session_id(task_id), message, None, events, false)
            .await
    }

    async fn turn(
        &self,
        session_id: &str,
        text: &str,
        intent: Option<&str>,
        events: Option<&UnboundedSender<LoopEvent>>,
        use_cache: bool,
    ) -> TurnReply {
        let mut messages = self.memory.history(session_id);
        messages.push(ChatMessage::user(text));

        if use_cache && let Some((cached, similarity)) = self.semantic_cache.get_or_similar(text) {
            info!(session_id, similarity, "answered from semantic cache");
            messages.push(ChatMessage::assistant(cached.clone()));
            self.memory.store(session_id, messages);
            if let Some(tx) = events {
                let _ = tx.send(LoopEvent::Clear);
                let _ = tx.send(LoopEvent::Token(cached.clone()));
                let _ = tx.send(LoopEvent::Done {
                    full_text: cached.clone(),
                    outcome: LoopOutcome::Answered,
                });
            }
            return TurnReply {
                text: cached,
                source: ReplySource::Cache { similarity },
            };
        }

        let report = self
            .tool_loop
            .run(session_id, &self.system_prompt, &mut messages, intent, events)
            .await;
        self.memory.store(session_id, messages);

        if use_cache
            && report.outcome == LoopOutcome::Answered
            && !report.used_tools
            && !report.full_text.is_empty()
        {
            self.semantic_cache.set(text, &report.full_text);
        }
        if report.outcome == LoopOutcome::Failed {
            warn!(session_id, "turn failed");
        }

        TurnReply {
            text: report.full_text.clone(),
            source: ReplySource::Model(report),
        }
    }
}
