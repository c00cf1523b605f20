pub mod chain;
pub mod error;
pub mod health;

pub use chain::{ChainStats, FallbackOutcome, ProviderFallbackChain, should_retry};
pub use error::{ClassifiedError, ErrorKind, classify, classify_error, kind_for_status};
pub use health::ProviderHealth;
