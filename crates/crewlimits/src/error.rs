use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RateLimitError {
    /// The request can never be granted, however long the caller waits.
    #[error("Requested {amount} tokens but bucket capacity is {capacity}")]
    ExceedsCapacity { amount: f64, capacity: f64 },

    #[error("Invalid token amount: {0}")]
    InvalidAmount(f64),

    #[error("Invalid rate: {0} tokens per minute")]
    InvalidRate(f64),
}
