use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::cache::PromptCacheManager;
use crate::config::{LlmConfig, ProviderConfig};
use crate::llm::backend::http_client;
use crate::llm::stream::{SseDecoder, ToolDeltaBuffer};
use crate::llm::types::{ChatMessage, ModelTurn, ToolDef, TurnRequest, Usage};
use crate::resilience::{ClassifiedError, classify, kind_for_status};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    Error {
        error: ApiError,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Client for the Anthropic Messages API with prompt caching.
#[derive(Clone)]
pub struct AnthropicClient {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    max_tokens: u32,
    inner: reqwest::Client,
    prompt_cache: Arc<PromptCacheManager>,
}

impl AnthropicClient {
    pub fn new(
        provider: &ProviderConfig,
        llm: &LlmConfig,
        prompt_cache: Arc<PromptCacheManager>,
    ) -> Result<Self> {
        Ok(Self {
            name: provider.name.clone(),
            base_url: provider.base_url.clone(),
            api_key: provider.resolve_api_key(),
            model: provider.model.clone(),
            max_tokens: llm.max_tokens,
            inner: http_client(llm)?,
            prompt_cache,
        })
    }

    pub(crate) fn endpoint(&self) -> String {
        let mut base = self.base_url.trim_end_matches('/').to_string();
        if let Some(pos) = base.rfind("/v1") {
            base.truncate(pos);
            base = base.trim_end_matches('/').to_string();
        }
        format!("{base}/v1/messages")
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        if let Some(key) = &self.api_key {
            let value =
                HeaderValue::from_str(key).context("api key is not a valid header value")?;
            headers.insert("x-api-key", value);
        }
        Ok(headers)
    }

    fn request_body(&self, req: &TurnRequest) -> Value {
        let intent = req.intent.as_deref();
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": self.prompt_cache.system_field(&req.system, intent),
            "messages": to_anthropic_messages(&req.messages, &self.prompt_cache, intent),
            "stream": true,
        });
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(req.tools.iter().map(to_anthropic_tool).collect());
        }
        body
    }

    pub async fn complete(&self, req: &TurnRequest) -> Result<ModelTurn> {
        let url = self.endpoint();
        let body = self.request_body(req);
        debug!(provider = %self.name, endpoint = %url, tools = req.tools.len(), "sending messages stream request");

        let resp = self
            .inner
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .context("send messages request")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!(provider = %self.name, status = %status.as_u16(), body = %text, "messages stream non-success status");
            return Err(ClassifiedError::new(
                kind_for_status(status),
                &self.name,
                format!("{status} - {text}"),
            )
            .into());
        }

        let mut decoder = SseDecoder::new();
        let mut acc = TurnAccumulator::default();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.context("read messages stream")?;
            for payload in decoder.push(&bytes) {
                acc.apply(&payload, &self.name)?;
            }
        }
        if let Some(payload) = decoder.finish() {
            acc.apply(&payload, &self.name)?;
        }
        let turn = acc.finish();
        self.prompt_cache.record_usage(&turn.usage, &self.model);
        debug!(
            provider = %self.name,
            text_len = turn.text.len(),
            tool_calls = turn.tool_calls.len(),
            input_tokens = turn.usage.input_tokens,
            output_tokens = turn.usage.output_tokens,
            "messages stream finished"
        );
        Ok(turn)
    }
}

#[derive(Default)]
struct TurnAccumulator {
    text: String,
    tools: ToolDeltaBuffer,
    usage: Usage,
}

impl TurnAccumulator {
    fn apply(&mut self, payload: &str, provider: &str) -> Result<()> {
        let event: StreamEvent = match serde_json::from_str(payload) {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, payload = %payload, "skipping unparsable stream event");
                return Ok(());
            }
        };
        match event {
            StreamEvent::MessageStart { message } => {
                if let Some(u) = message.usage {
                    self.merge_usage(u);
                }
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::ToolUse { id, name },
            } => self.tools.push_delta(index, Some(&name), None, Some(&id)),
            StreamEvent::ContentBlockStart { .. } => {}
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => self.text.push_str(&text),
                BlockDelta::InputJsonDelta { partial_json } => {
                    self.tools.push_delta(index, None, Some(&partial_json), None)
                }
                BlockDelta::Other => {}
            },
            StreamEvent::MessageDelta { usage: Some(u) } => self.merge_usage(u),
            StreamEvent::MessageDelta { usage: None } => {}
            StreamEvent::Error { error } => {
                warn!(provider, kind = %error.kind, message = %error.message, "stream error event");
                let text = format!("{}: {}", error.kind, error.message);
                return Err(ClassifiedError::new(classify(&text, provider), provider, text).into());
            }
            StreamEvent::Other => {}
        }
        Ok(())
    }

    fn merge_usage(&mut self, u: WireUsage) {
        if let Some(v) = u.input_tokens {
            self.usage.input_tokens = v;
        }
        if let Some(v) = u.output_tokens {
            self.usage.output_tokens = v;
        }
        if let Some(v) = u.cache_creation_input_tokens {
            self.usage.cache_creation_input_tokens = v;
        }
        if let Some(v) = u.cache_read_input_tokens {
            self.usage.cache_read_input_tokens = v;
        }
    }

    fn finish(self) -> ModelTurn {
        ModelTurn {
            text: self.text,
            tool_calls: self.tools.finish(),
            usage: self.usage,
        }
    }
}

fn to_anthropic_tool(def: &ToolDef) -> Value {
    json!({
        "name": def.function.name,
        "description": def.function.description,
        "input_schema": def.function.parameters,
    })
}

/// Converts chat-shaped history into Messages API turns. Tool results become
/// `tool_result` blocks in a user turn, and consecutive user-side turns are
/// merged so roles keep alternating. The last user text block may carry a
/// cache marker.
fn to_anthropic_messages(
    messages: &[ChatMessage],
    prompt_cache: &PromptCacheManager,
    intent: Option<&str>,
) -> Vec<Value> {
    let last_user = messages.iter().rposition(|m| m.role == "user");
    let mut out: Vec<(String, Vec<Value>)> = Vec::new();
    for (i, msg) in messages.iter().enumerate() {
        let (role, blocks) = match msg.role.as_str() {
            "assistant" => {
                let mut blocks = Vec::new();
                if let Some(text) = msg.content.as_deref().filter(|t| !t.is_empty()) {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                for call in &msg.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id.clone().unwrap_or_default(),
                        "name": call.name(),
                        "input": call.arguments_json(),
                    }));
                }
                ("assistant", blocks)
            }
            "tool" => (
                "user",
                vec![json!({
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "content": msg.content.clone().unwrap_or_default(),
                })],
            ),
            _ => {
                let content = msg.content.as_deref().unwrap_or_default();
                (
                    "user",
                    prompt_cache.user_context_blocks(content, Some(i) == last_user, intent),
                )
            }
        };
        if blocks.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some((prev, prev_blocks)) if prev == role => prev_blocks.extend(blocks),
            _ => out.push((role.to_string(), blocks)),
        }
    }
    out.into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect()
}
