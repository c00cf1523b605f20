//! Conversational tool-call loop and the tools it can drive.

pub mod abort;
pub mod optimizer;
pub mod scheduler_tools;
pub mod tool_loop;
pub mod tools;
#[cfg(test)]
mod tests;

pub use abort::AbortFlags;
pub use tool_loop::{LoopEvent, LoopOutcome, LoopReport, ToolCallLoop, auto_stop_text};
pub use tools::{Tool, ToolRegistry};
