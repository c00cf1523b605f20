use crate::utils::lock_or_recover;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Per-session cancellation flags for the tool loop.
///
/// A request stays pending until the loop observes it with [`take`], which
/// also resets it so the next turn of the same session starts clean.
///
/// [`take`]: AbortFlags::take
#[derive(Debug, Default)]
pub struct AbortFlags {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl AbortFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, session_id: &str) {
        lock_or_recover(&self.tokens)
            .entry(session_id.to_string())
            .or_default()
            .cancel();
        info!(session_id, "abort requested");
    }

    pub fn is_requested(&self, session_id: &str) -> bool {
        lock_or_recover(&self.tokens)
            .get(session_id)
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Returns whether an abort was pending and clears it.
    pub fn take(&self, session_id: &str) -> bool {
        let mut tokens = lock_or_recover(&self.tokens);
        match tokens.get(session_id) {
            Some(t) if t.is_cancelled() => {
                tokens.remove(session_id);
                true
            }
            _ => false,
        }
    }

    pub fn clear(&self, session_id: &str) {
        lock_or_recover(&self.tokens).remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_consumes_the_request() {
        let flags = AbortFlags::new();
        assert!(!flags.take("default"));
        flags.request("default");
        assert!(flags.is_requested("default"));
        assert!(!flags.is_requested("other"));
        assert!(flags.take("default"));
        assert!(!flags.take("default"));
    }
}
