pub mod prompt;
pub mod semantic;

pub use prompt::{PromptCacheManager, PromptCacheStats};
pub use semantic::{SemanticCache, SemanticCacheStats, SimilarHit};
