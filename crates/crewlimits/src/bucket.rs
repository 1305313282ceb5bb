use crate::RateLimitError;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Shortest wait between refill attempts. Keeps float rounding from turning
/// the remaining shortfall into a zero-length sleep that never advances time.
const MIN_WAIT: Duration = Duration::from_millis(1);

struct BucketState {
    tokens: f64,
    /// Tokens per second.
    refill_rate: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, capacity: f64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(capacity);
        self.last_refill = now;
    }
}

enum Attempt {
    Granted,
    /// Not enough tokens; this long until there would be.
    Short(Duration),
}

/// Token bucket for a single rate-limited resource.
///
/// Holds up to `capacity` tokens and refills continuously at
/// `tokens_per_minute / 60` tokens per second. A new bucket starts full.
/// Time is read from `tokio::time::Instant`, so a paused tokio clock drives it
/// in tests.
pub struct TokenBucket {
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Bucket whose capacity equals one minute of tokens.
    pub fn new(tokens_per_minute: f64) -> Result<Self, RateLimitError> {
        Self::with_capacity(tokens_per_minute, tokens_per_minute)
    }

    pub fn with_capacity(capacity: f64, tokens_per_minute: f64) -> Result<Self, RateLimitError> {
        validate_rate(tokens_per_minute)?;
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(RateLimitError::InvalidAmount(capacity));
        }

        Ok(Self {
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                refill_rate: tokens_per_minute / 60.0,
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.state().refill_rate
    }

    pub fn tokens_per_minute(&self) -> f64 {
        self.refill_rate() * 60.0
    }

    /// Current fill level, after refilling for the time elapsed.
    pub fn available(&self) -> f64 {
        let mut state = self.state();
        state.refill(self.capacity);
        state.tokens
    }

    /// Consume `amount` tokens if they are available right now.
    pub fn try_consume(&self, amount: f64) -> Result<bool, RateLimitError> {
        self.validate(amount)?;
        Ok(matches!(self.attempt(amount), Attempt::Granted))
    }

    /// Consume `amount` tokens, sleeping until they are available if `wait`.
    ///
    /// Never consumes partially. With `wait` a successful return always means
    /// the full amount was granted. Amounts above capacity are rejected up
    /// front since no amount of waiting could satisfy them.
    pub async fn consume(&self, amount: f64, wait: bool) -> Result<bool, RateLimitError> {
        self.validate(amount)?;

        loop {
            match self.attempt(amount) {
                Attempt::Granted => return Ok(true),
                Attempt::Short(_) if !wait => return Ok(false),
                Attempt::Short(delay) => {
                    tracing::debug!("Rate limited: waiting {:?} for {} tokens", delay, amount);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Change the refill rate. Tokens accrued so far are credited at the old
    /// rate first; capacity is unchanged.
    pub fn set_rate(&self, tokens_per_minute: f64) -> Result<(), RateLimitError> {
        validate_rate(tokens_per_minute)?;
        let mut state = self.state();
        state.refill(self.capacity);
        state.refill_rate = tokens_per_minute / 60.0;
        Ok(())
    }

    fn attempt(&self, amount: f64) -> Attempt {
        let mut state = self.state();
        state.refill(self.capacity);

        if state.tokens >= amount {
            state.tokens -= amount;
            return Attempt::Granted;
        }

        let missing = amount - state.tokens;
        let delay =
            Duration::try_from_secs_f64(missing / state.refill_rate).unwrap_or(Duration::MAX);
        Attempt::Short(delay.max(MIN_WAIT))
    }

    fn validate(&self, amount: f64) -> Result<(), RateLimitError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(RateLimitError::InvalidAmount(amount));
        }
        if amount > self.capacity {
            return Err(RateLimitError::ExceedsCapacity {
                amount,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate_rate(tokens_per_minute: f64) -> Result<(), RateLimitError> {
    if !tokens_per_minute.is_finite() || tokens_per_minute <= 0.0 {
        return Err(RateLimitError::InvalidRate(tokens_per_minute));
    }
    Ok(())
}
