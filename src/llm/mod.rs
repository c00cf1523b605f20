//! Provider backends.
//!
//! Each round of the tool loop goes through [`ModelBackend::complete`]. The
//! HTTP implementation streams server-sent events from OpenAI-compatible
//! chat completions or the Anthropic Messages API and folds them into a
//! provider-neutral [`ModelTurn`].

mod anthropic;
mod backend;
mod openai;
mod stream;
pub mod types;

pub use anthropic::AnthropicClient;
pub use backend::{HttpBackend, ModelBackend};
pub use openai::OpenAiClient;
pub use types::*;
