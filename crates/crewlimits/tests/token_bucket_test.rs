// crates/crewlimits/tests/token_bucket_test.rs

use crewlimits::{ProviderLimits, RateLimitError, TokenBucket, TokenBucketManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

#[tokio::test(start_paused = true)]
async fn test_full_bucket_drains_exactly_once() {
    let bucket = TokenBucket::new(60.0).unwrap();
    assert_eq!(bucket.capacity(), 60.0);

    assert!(bucket.consume(60.0, false).await.unwrap());
    assert!(!bucket.consume(1.0, false).await.unwrap());
    assert!(!bucket.try_consume(1.0).unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_refills_one_token_per_second_at_sixty_per_minute() {
    let bucket = TokenBucket::new(60.0).unwrap();
    assert!(bucket.try_consume(60.0).unwrap());
    assert!(!bucket.try_consume(1.0).unwrap());

    tokio::time::advance(Duration::from_secs(1)).await;

    assert!(bucket.try_consume(1.0).unwrap());
    assert!(!bucket.try_consume(1.0).unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_refill_never_exceeds_capacity() {
    let bucket = TokenBucket::new(120.0).unwrap();
    assert!(bucket.try_consume(10.0).unwrap());

    tokio::time::advance(Duration::from_secs(3600)).await;

    assert!(approx(bucket.available(), 120.0));
}

#[tokio::test(start_paused = true)]
async fn test_refused_consume_leaves_state_unchanged() {
    let bucket = TokenBucket::new(60.0).unwrap();
    assert!(bucket.try_consume(55.0).unwrap());

    assert!(!bucket.consume(10.0, false).await.unwrap());
    assert!(approx(bucket.available(), 5.0));
}

#[tokio::test(start_paused = true)]
async fn test_waiting_consume_blocks_for_missing_tokens() {
    let bucket = TokenBucket::new(60.0).unwrap();
    assert!(bucket.try_consume(58.0).unwrap());

    let started = Instant::now();
    assert!(bucket.consume(5.0, true).await.unwrap());
    let waited = started.elapsed();

    // Two tokens were left, three were missing at one token per second.
    assert!(waited >= Duration::from_secs(3), "waited {:?}", waited);
    assert!(waited < Duration::from_millis(3100), "waited {:?}", waited);
    assert!(bucket.available() >= 0.0);
    assert!(bucket.available() < 0.1);
}

#[tokio::test(start_paused = true)]
async fn test_waiting_consume_survives_rounding_at_uneven_rates() {
    // 7 tokens/min leaves a sub-nanosecond shortfall after the computed wait.
    let bucket = TokenBucket::new(7.0).unwrap();
    assert!(bucket.try_consume(7.0).unwrap());

    let started = Instant::now();
    let granted = tokio::time::timeout(Duration::from_secs(120), bucket.consume(6.993, true))
        .await
        .expect("waiting consume should be granted well before the deadline")
        .unwrap();
    assert!(granted);

    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(59_900), "waited {:?}", waited);
    assert!(waited < Duration::from_secs(61), "waited {:?}", waited);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_waiters_are_all_granted_without_going_negative() {
    let bucket = Arc::new(TokenBucket::new(60.0).unwrap());
    assert!(bucket.try_consume(60.0).unwrap());

    let started = Instant::now();
    let waiters = (0..5).map(|_| {
        let bucket = Arc::clone(&bucket);
        async move { bucket.consume(2.0, true).await }
    });
    for granted in futures::future::join_all(waiters).await {
        assert!(granted.unwrap());
    }

    // Ten tokens at one per second.
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(bucket.available() >= 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_zero_amount_always_succeeds() {
    let bucket = TokenBucket::new(60.0).unwrap();
    assert!(bucket.try_consume(60.0).unwrap());

    assert!(bucket.consume(0.0, false).await.unwrap());
    assert!(bucket.consume(0.0, true).await.unwrap());
}

#[tokio::test]
async fn test_amount_above_capacity_fails_fast() {
    let bucket = TokenBucket::new(60.0).unwrap();

    let err = bucket.consume(61.0, true).await.unwrap_err();
    assert_eq!(
        err,
        RateLimitError::ExceedsCapacity {
            amount: 61.0,
            capacity: 60.0
        }
    );
    // Nothing was taken.
    assert!(bucket.try_consume(60.0).unwrap());
}

#[test]
fn test_invalid_amounts_and_rates_are_rejected() {
    assert!(matches!(
        TokenBucket::new(0.0),
        Err(RateLimitError::InvalidRate(_))
    ));
    assert!(matches!(
        TokenBucket::new(f64::NAN),
        Err(RateLimitError::InvalidRate(_))
    ));

    let bucket = TokenBucket::new(60.0).unwrap();
    assert!(matches!(
        bucket.try_consume(-1.0),
        Err(RateLimitError::InvalidAmount(_))
    ));
    assert!(matches!(
        bucket.try_consume(f64::INFINITY),
        Err(RateLimitError::InvalidAmount(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_set_rate_changes_refill_speed() {
    let bucket = TokenBucket::new(60.0).unwrap();
    assert!(bucket.try_consume(60.0).unwrap());

    bucket.set_rate(120.0).unwrap();
    assert!(approx(bucket.refill_rate(), 2.0));
    assert_eq!(bucket.capacity(), 60.0);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(bucket.try_consume(2.0).unwrap());

    assert!(matches!(
        bucket.set_rate(-5.0),
        Err(RateLimitError::InvalidRate(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_manager_keeps_rate_fixed_at_creation() {
    let manager = TokenBucketManager::new();

    assert!(manager
        .consume_tokens("openai", 60.0, 60.0, false)
        .await
        .unwrap());
    // Same key, much higher rate: still the original 60-token bucket.
    assert!(!manager
        .consume_tokens("openai", 1.0, 6_000.0, false)
        .await
        .unwrap());

    assert_eq!(manager.len(), 1);
    let bucket = manager.bucket("openai").unwrap();
    assert!(approx(bucket.refill_rate(), 1.0));
    assert_eq!(bucket.capacity(), 60.0);

    let again = manager.get_bucket("openai", 1.0).unwrap();
    assert!(Arc::ptr_eq(&bucket, &again));
}

#[tokio::test(start_paused = true)]
async fn test_manager_update_rate_is_explicit() {
    let manager = TokenBucketManager::new();
    assert!(!manager.update_rate("missing", 10.0).unwrap());

    manager.get_bucket("anthropic", 60.0).unwrap();
    assert!(manager.update_rate("anthropic", 600.0).unwrap());
    assert!(approx(
        manager.bucket("anthropic").unwrap().refill_rate(),
        10.0
    ));
}

#[tokio::test(start_paused = true)]
async fn test_keys_get_independent_buckets() {
    let manager = TokenBucketManager::new();

    assert!(manager.consume_tokens("a", 10.0, 10.0, false).await.unwrap());
    assert!(manager.consume_tokens("b", 10.0, 10.0, false).await.unwrap());
    assert!(!manager.consume_tokens("a", 1.0, 10.0, false).await.unwrap());

    let mut keys = manager.keys();
    keys.sort();
    assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn test_concurrent_creation_yields_one_bucket() {
    let manager = Arc::new(TokenBucketManager::new());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || manager.get_bucket("shared", 60.0 + i as f64).unwrap())
        })
        .collect();
    let buckets: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(manager.len(), 1);
    for bucket in &buckets[1..] {
        assert!(Arc::ptr_eq(&buckets[0], bucket));
    }
}

#[tokio::test(start_paused = true)]
async fn test_provider_limits_drive_bucket_rate() {
    let manager = TokenBucketManager::new();
    let limits = ProviderLimits::new(10.0, 300.0);

    assert!(manager
        .consume_for_provider("provider", 3_000.0, &limits, false)
        .await
        .unwrap());
    assert!(!manager
        .consume_for_provider("provider", 1.0, &limits, false)
        .await
        .unwrap());

    let bucket = manager.bucket("provider").unwrap();
    assert_eq!(bucket.capacity(), 3_000.0);
    assert!(approx(bucket.refill_rate(), 50.0));
}
