use crate::llm::Usage;
use crate::utils::lock_or_recover;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Mutex;
use tracing::{debug, info};

/// Intents whose prompts repeat enough to be worth an ephemeral cache entry.
pub const CACHEABLE_INTENTS: &[&str] = &[
    "config_edit",
    "config_read",
    "entity_query",
    "automation_create",
];

/// Context blocks shorter than this are never marked cacheable.
const MIN_CACHEABLE_CHARS: usize = 1000;
/// Rough USD saving per cached input token (reads cost 10% of normal).
const SAVING_PER_CACHED_TOKEN: f64 = 0.9 * 0.003 / 1000.0;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PromptCacheStats {
    pub cache_enabled: bool,
    pub hits: u64,
    pub writes: u64,
    pub tokens_from_cache: u64,
    pub tokens_to_cache: u64,
    pub tokens_computed: u64,
    pub total_cost_saving_usd: f64,
    pub last_hit: Option<DateTime<Utc>>,
    pub last_write: Option<DateTime<Utc>>,
    pub cacheable_intents: Vec<String>,
}

/// Anthropic prompt caching: `cache_control` markers on the system prompt
/// and large context blocks, plus usage accounting.
pub struct PromptCacheManager {
    enabled: bool,
    stats: Mutex<PromptCacheStats>,
}

impl PromptCacheManager {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            stats: Mutex::new(PromptCacheStats::default()),
        }
    }

    pub fn should_cache_intent(&self, intent: Option<&str>) -> bool {
        self.enabled && intent.is_some_and(|i| CACHEABLE_INTENTS.contains(&i))
    }

    fn cache_control() -> Value {
        json!({"type": "ephemeral"})
    }

    /// The `system` field of a Messages API request: a plain string, or a
    /// single cached text block when the intent is cacheable.
    pub fn system_field(&self, system_prompt: &str, intent: Option<&str>) -> Value {
        if !self.should_cache_intent(intent) {
            return Value::String(system_prompt.to_string());
        }
        debug!(intent, "wrapping system prompt for caching");
        json!([{
            "type": "text",
            "text": system_prompt,
            "cache_control": Self::cache_control(),
        }])
    }

    /// Content blocks for a user context string. Only large blocks of a
    /// cacheable intent get a marker, and only when `cache_last_block`.
    pub fn user_context_blocks(
        &self,
        content: &str,
        cache_last_block: bool,
        intent: Option<&str>,
    ) -> Vec<Value> {
        let cacheable = cache_last_block
            && self.should_cache_intent(intent)
            && content.chars().count() >= MIN_CACHEABLE_CHARS;
        if !cacheable {
            return vec![json!({"type": "text", "text": content})];
        }
        debug!(chars = content.len(), intent, "caching large context block");
        vec![json!({
            "type": "text",
            "text": content,
            "cache_control": Self::cache_control(),
        })]
    }

    pub fn record_usage(&self, usage: &Usage, model: &str) {
        let mut stats = lock_or_recover(&self.stats);
        if usage.cache_read_input_tokens > 0 {
            let saving = usage.cache_read_input_tokens as f64 * SAVING_PER_CACHED_TOKEN;
            stats.hits += 1;
            stats.tokens_from_cache += usage.cache_read_input_tokens;
            stats.total_cost_saving_usd += saving;
            stats.last_hit = Some(Utc::now());
            info!(
                tokens = usage.cache_read_input_tokens,
                saving_usd = saving,
                model,
                "prompt cache hit"
            );
        }
        if usage.cache_creation_input_tokens > 0 {
            stats.writes += 1;
            stats.tokens_to_cache += usage.cache_creation_input_tokens;
            stats.last_write = Some(Utc::now());
            info!(
                tokens = usage.cache_creation_input_tokens,
                model, "prompt cache write"
            );
        }
        if usage.cache_read_input_tokens == 0 && usage.cache_creation_input_tokens == 0 {
            stats.tokens_computed += usage.input_tokens;
        }
    }

    pub fn stats(&self) -> PromptCacheStats {
        PromptCacheStats {
            cache_enabled: self.enabled,
            cacheable_intents: CACHEABLE_INTENTS.iter().map(|s| s.to_string()).collect(),
            ..lock_or_recover(&self.stats).clone()
        }
    }

    pub fn reset_stats(&self) {
        *lock_or_recover(&self.stats) = PromptCacheStats::default();
        info!("prompt cache statistics reset");
    }
}
