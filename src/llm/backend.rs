use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::PromptCacheManager;
use crate::config::{AppConfig, LlmConfig, ProviderKind};
use crate::llm::anthropic::AnthropicClient;
use crate::llm::openai::OpenAiClient;
use crate::llm::types::{ModelTurn, TurnRequest, Usage};

/// Something that can run one model round against a named provider.
/// Failures should be `ClassifiedError`s when the cause is known.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn complete(&self, provider: &str, req: &TurnRequest) -> Result<ModelTurn>;

    /// USD cost of a round served by `provider`, if rates are known.
    fn cost_for(&self, _provider: &str, _usage: &Usage) -> Option<f64> {
        None
    }
}

pub(crate) fn http_client(cfg: &LlmConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
        .timeout(Duration::from_millis(cfg.request_timeout_ms))
        .build()?)
}

enum ProviderClient {
    OpenAi(OpenAiClient),
    Anthropic(AnthropicClient),
}

struct Registered {
    client: ProviderClient,
    rates: Option<(f64, f64)>,
}

/// Real HTTP backends keyed by provider name.
pub struct HttpBackend {
    clients: HashMap<String, Registered>,
}

impl HttpBackend {
    pub fn from_config(cfg: &AppConfig, prompt_cache: Arc<PromptCacheManager>) -> Result<Self> {
        let mut clients = HashMap::new();
        for p in &cfg.providers {
            if p.resolve_api_key().is_none() {
                warn!(provider = %p.name, "no api key configured; requests will likely fail with auth errors");
            }
            let client = match p.kind {
                ProviderKind::OpenAi => ProviderClient::OpenAi(OpenAiClient::new(p, &cfg.llm)?),
                ProviderKind::Anthropic => ProviderClient::Anthropic(AnthropicClient::new(
                    p,
                    &cfg.llm,
                    prompt_cache.clone(),
                )?),
            };
            let rates = p.input_cost_per_mtok.zip(p.output_cost_per_mtok);
            info!(provider = %p.name, model = %p.model, kind = ?p.kind, "registered provider");
            clients.insert(p.name.clone(), Registered { client, rates });
        }
        Ok(Self { clients })
    }
}

#[async_trait]
impl ModelBackend for HttpBackend {
    async fn complete(&self, provider: &str, req: &TurnRequest) -> Result<ModelTurn> {
        let reg = self
            .clients
            .get(provider)
            .ok_or_else(|| anyhow!("invalid request: unknown provider '{provider}'"))?;
        match &reg.client {
            ProviderClient::OpenAi(c) => c.complete(req).await,
            ProviderClient::Anthropic(c) => c.complete(req).await,
        }
    }

    fn cost_for(&self, provider: &str, usage: &Usage) -> Option<f64> {
        let (input, output) = self.clients.get(provider)?.rates?;
        Some(usage.cost(input, output))
    }
}
