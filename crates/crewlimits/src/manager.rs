use crate::{ProviderLimits, RateLimitError, TokenBucket};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Named registry of token buckets, created lazily on first use.
///
/// Lookups take only the shared read lock; the write lock is held just long
/// enough to insert a new bucket. Consuming tokens locks only the bucket
/// itself, so busy keys do not contend with each other.
#[derive(Default)]
pub struct TokenBucketManager {
    buckets: RwLock<HashMap<String, Arc<TokenBucket>>>,
}

impl TokenBucketManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing bucket for `key`, or a new one at `tokens_per_minute`.
    ///
    /// The rate is fixed when the bucket is created; a different rate on a
    /// later call is ignored. Use `update_rate` to change it.
    pub fn get_bucket(
        &self,
        key: &str,
        tokens_per_minute: f64,
    ) -> Result<Arc<TokenBucket>, RateLimitError> {
        if let Some(bucket) = self.bucket(key) {
            if (bucket.tokens_per_minute() - tokens_per_minute).abs() > f64::EPSILON {
                tracing::debug!(
                    "Bucket {} keeps its rate of {} tokens/min (ignoring {})",
                    key,
                    bucket.tokens_per_minute(),
                    tokens_per_minute
                );
            }
            return Ok(bucket);
        }

        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have created it between our read and write locks.
        if let Some(bucket) = buckets.get(key) {
            return Ok(Arc::clone(bucket));
        }

        let bucket = Arc::new(TokenBucket::new(tokens_per_minute)?);
        tracing::info!(
            "Created rate limit bucket {} at {} tokens/min",
            key,
            tokens_per_minute
        );
        buckets.insert(key.to_string(), Arc::clone(&bucket));
        Ok(bucket)
    }

    /// Look up a bucket without creating it.
    pub fn bucket(&self, key: &str) -> Option<Arc<TokenBucket>> {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub async fn consume_tokens(
        &self,
        key: &str,
        amount: f64,
        tokens_per_minute: f64,
        wait: bool,
    ) -> Result<bool, RateLimitError> {
        let bucket = self.get_bucket(key, tokens_per_minute)?;
        bucket.consume(amount, wait).await
    }

    /// `consume_tokens` at the rate derived from a provider's published limits.
    pub async fn consume_for_provider(
        &self,
        key: &str,
        amount: f64,
        limits: &ProviderLimits,
        wait: bool,
    ) -> Result<bool, RateLimitError> {
        self.consume_tokens(key, amount, limits.effective_tokens_per_minute(), wait)
            .await
    }

    /// Change the rate of an existing bucket. Returns false if there is none.
    pub fn update_rate(&self, key: &str, tokens_per_minute: f64) -> Result<bool, RateLimitError> {
        match self.bucket(key) {
            Some(bucket) => {
                bucket.set_rate(tokens_per_minute)?;
                tracing::info!("Bucket {} now refills at {} tokens/min", key, tokens_per_minute);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
