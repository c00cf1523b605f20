use crate::llm::ChatMessage;
use crate::utils::lock_or_recover;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// In-memory conversation history per session. Last write wins.
#[derive(Debug, Default)]
pub struct ConversationMemory {
    sessions: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self, session_id: &str) -> Vec<ChatMessage> {
        lock_or_recover(&self.sessions)
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn store(&self, session_id: &str, messages: Vec<ChatMessage>) {
        lock_or_recover(&self.sessions).insert(session_id.to_string(), messages);
    }

    pub fn clear(&self, session_id: &str) -> bool {
        lock_or_recover(&self.sessions).remove(session_id).is_some()
    }

    pub fn sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock_or_recover(&self.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Keeps at most `max_messages` per session and returns how many were
    /// dropped. A trimmed history always starts at a user message so no
    /// tool result is left without its call.
    pub fn trim_all(&self, max_messages: usize) -> usize {
        let mut sessions = lock_or_recover(&self.sessions);
        let mut dropped = 0;
        for (id, messages) in sessions.iter_mut() {
            if messages.len() <= max_messages {
                continue;
            }
            let mut cut = messages.len() - max_messages;
            while cut < messages.len() && messages[cut].role != "user" {
                cut += 1;
            }
            messages.drain(..cut);
            dropped += cut;
            debug!(session_id = %id, dropped = cut, kept = messages.len(), "trimmed conversation");
        }
        dropped
    }
}
