use serde::{Deserialize, Serialize};

/// Safety ceiling on any derived tokens-per-minute budget.
pub const DEFAULT_TOKENS_PER_MINUTE_CEILING: f64 = 100_000.0;

/// Request and token limits published by an external provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderLimits {
    pub requests_per_minute: f64,
    pub avg_tokens_per_request: f64,
    #[serde(default = "default_ceiling")]
    pub ceiling: f64,
}

fn default_ceiling() -> f64 {
    DEFAULT_TOKENS_PER_MINUTE_CEILING
}

impl ProviderLimits {
    pub fn new(requests_per_minute: f64, avg_tokens_per_request: f64) -> Self {
        Self {
            requests_per_minute,
            avg_tokens_per_request,
            ceiling: DEFAULT_TOKENS_PER_MINUTE_CEILING,
        }
    }

    pub fn with_ceiling(mut self, ceiling: f64) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Tokens per minute allowed by whichever limit binds first, never above
    /// the ceiling.
    pub fn effective_tokens_per_minute(&self) -> f64 {
        (self.requests_per_minute * self.avg_tokens_per_request).min(self.ceiling)
    }
}
