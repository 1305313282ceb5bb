//! Token-bucket rate limiting for outbound provider calls
//!
//! An LLM-calling layer asks `TokenBucketManager::consume_tokens` for an
//! estimated token count right before each provider request. Buckets are
//! created lazily per key and live as long as the manager.

mod bucket;
mod error;
mod manager;
mod provider;

pub use bucket::TokenBucket;
pub use error::RateLimitError;
pub use manager::TokenBucketManager;
pub use provider::{ProviderLimits, DEFAULT_TOKENS_PER_MINUTE_CEILING};
