use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::{LlmConfig, ProviderConfig};
use crate::llm::backend::http_client;
use crate::llm::stream::{SseDecoder, ToolDeltaBuffer};
use crate::llm::types::{ChatMessage, ModelTurn, ToolDef, TurnRequest, Usage};
use crate::resilience::{ClassifiedError, kind_for_status};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolDef],
    max_tokens: u32,
    stream: bool,
    stream_options: StreamOptions,
}

fn no_tools(tools: &&[ToolDef]) -> bool {
    tools.is_empty()
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: ChoiceDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChoiceDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

/// Client for any OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    max_tokens: u32,
    inner: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(provider: &ProviderConfig, llm: &LlmConfig) -> Result<Self> {
        Ok(Self {
            name: provider.name.clone(),
            base_url: provider.base_url.clone(),
            api_key: provider.resolve_api_key(),
            model: provider.model.clone(),
            max_tokens: llm.max_tokens,
            inner: http_client(llm)?,
        })
    }

    pub(crate) fn endpoint(&self) -> String {
        let mut base = self.base_url.trim_end_matches('/').to_string();
        if let Some(pos) = base.rfind("/v1") {
            base.truncate(pos);
            base = base.trim_end_matches('/').to_string();
        }
        format!("{base}/v1/chat/completions")
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .context("api key is not a valid header value")?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    pub async fn complete(&self, req: &TurnRequest) -> Result<ModelTurn> {
        let url = self.endpoint();
        let mut messages = Vec::with_capacity(req.messages.len() + 1);
        if !req.system.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: Some(req.system.clone()),
                tool_calls: vec![],
                tool_call_id: None,
            });
        }
        messages.extend(req.messages.iter().cloned());
        let body = ChatRequest {
            model: &self.model,
            messages,
            tools: &req.tools,
            max_tokens: self.max_tokens,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        };
        debug!(provider = %self.name, endpoint = %url, tools = req.tools.len(), "sending chat.completions stream request");

        let resp = self
            .inner
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .context("send chat request")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!(provider = %self.name, status = %status.as_u16(), body = %text, "chat stream non-success status");
            return Err(ClassifiedError::new(
                kind_for_status(status),
                &self.name,
                format!("{status} - {text}"),
            )
            .into());
        }

        let mut decoder = SseDecoder::new();
        let mut tools = ToolDeltaBuffer::new();
        let mut turn = ModelTurn::default();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.context("read chat stream")?;
            for payload in decoder.push(&bytes) {
                apply_chunk(&payload, &mut turn, &mut tools);
            }
        }
        if let Some(payload) = decoder.finish() {
            apply_chunk(&payload, &mut turn, &mut tools);
        }
        turn.tool_calls = tools.finish();
        debug!(
            provider = %self.name,
            text_len = turn.text.len(),
            tool_calls = turn.tool_calls.len(),
            input_tokens = turn.usage.input_tokens,
            output_tokens = turn.usage.output_tokens,
            "chat stream finished"
        );
        Ok(turn)
    }
}

fn apply_chunk(payload: &str, turn: &mut ModelTurn, tools: &mut ToolDeltaBuffer) {
    let chunk: StreamChunk = match serde_json::from_str(payload) {
        Ok(c) => c,
        Err(e) => {
            debug!(error = %e, payload = %payload, "skipping unparsable stream chunk");
            return;
        }
    };
    for choice in chunk.choices {
        if let Some(text) = choice.delta.content {
            turn.text.push_str(&text);
        }
        for tc in choice.delta.tool_calls {
            let (name, args) = match &tc.function {
                Some(f) => (f.name.as_deref(), f.arguments.as_deref()),
                None => (None, None),
            };
            tools.push_delta(tc.index, name, args, tc.id.as_deref());
        }
    }
    if let Some(u) = chunk.usage {
        let cached = u.prompt_tokens_details.map(|d| d.cached_tokens).unwrap_or(0);
        turn.usage = Usage {
            input_tokens: u.prompt_tokens.saturating_sub(cached),
            output_tokens: u.completion_tokens,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: cached,
        };
    }
}
