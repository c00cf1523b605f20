use crate::llm::types::ToolCall;
use tracing::warn;

/// Splits a server-sent-events byte stream into `data:` payloads.
/// `event:`/`id:` lines, comments and `[DONE]` markers are dropped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        let mut start = 0usize;
        for i in 0..self.buf.len() {
            if self.buf[i] != b'\n' {
                continue;
            }
            let line = &self.buf[start..i];
            start = i + 1;
            let Ok(s) = std::str::from_utf8(line) else {
                warn!("dropping non-utf8 stream line");
                continue;
            };
            if let Some(payload) = data_payload(s) {
                out.push(payload.to_string());
            }
        }
        if start > 0 {
            self.buf.drain(0..start);
        }
        out
    }

    /// Flushes a trailing line that arrived without a newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let s = String::from_utf8(rest).ok()?;
        data_payload(&s).map(str::to_string)
    }
}

fn data_payload(line: &str) -> Option<&str> {
    let s = line.trim();
    if s.is_empty() || s.starts_with(':') {
        return None;
    }
    let payload = s.strip_prefix("data:")?.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    Some(payload)
}

#[derive(Debug, Clone, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

// Buffer to reconstruct tool calls from streamed deltas
#[derive(Debug, Default)]
pub struct ToolDeltaBuffer {
    // Each index may have an in-progress tool call
    calls: Vec<PartialToolCall>,
}

impl ToolDeltaBuffer {
    pub fn new() -> Self {
        Self { calls: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    // Append one delta; index can be sparse/increasing; we resize as needed
    pub fn push_delta(
        &mut self,
        index: usize,
        name_delta: Option<&str>,
        args_delta: Option<&str>,
        id: Option<&str>,
    ) {
        if self.calls.len() <= index {
            self.calls.resize_with(index + 1, Default::default);
        }
        let slot = &mut self.calls[index];
        if let Some(idv) = id
            && !idv.is_empty()
            && slot.id.is_none()
        {
            slot.id = Some(idv.to_string());
        }
        if let Some(n) = name_delta {
            slot.name.push_str(n);
        }
        if let Some(a) = args_delta {
            slot.arguments.push_str(a);
        }
    }

    /// Completed calls in index order. Slots that never received a name are
    /// dropped; arguments that are empty or not valid JSON become `{}`.
    pub fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .enumerate()
            .filter(|(_, c)| !c.name.is_empty())
            .map(|(i, c)| {
                let arguments = match serde_json::from_str::<serde_json::Value>(&c.arguments) {
                    Ok(serde_json::Value::Object(_)) => c.arguments,
                    _ => {
                        if !c.arguments.trim().is_empty() {
                            warn!(tool = %c.name, args = %c.arguments, "invalid tool arguments JSON, using {{}}");
                        }
                        "{}".to_string()
                    }
                };
                let id = c.id.unwrap_or_else(|| format!("call_{i}"));
                ToolCall::new(id, c.name, arguments)
            })
            .collect()
    }
}
