use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bulwark::clock::ManualClock;
use bulwark::ratelimit::{Algorithm, Limiter, LocalRateLimiter, RateLimiter, TokenBucket};
use bulwark::{BreakerConfig, BreakerError, CircuitBreaker, CircuitState, HashRing, RingConfig};
use futures::future::join_all;
use tokio_test::{assert_err, assert_ok};

const START: Duration = Duration::from_secs(1_700_000_000);

#[tokio::test]
async fn token_bucket_burst_then_refill() {
    let clock = ManualClock::new(START);
    let bucket = assert_ok!(TokenBucket::with_clock(10, 10.0, clock.clone()));

    for i in 0..10 {
        assert!(bucket.allow(), "call {i} should be allowed");
    }
    let denied = bucket.check();
    assert!(!denied.allowed);
    assert!(denied.reset_after > Duration::ZERO);

    clock.advance(Duration::from_millis(100));
    assert!(bucket.allow());
}

#[tokio::test]
async fn token_bucket_limiter_denies_after_limit() {
    let clock = ManualClock::new(START);
    let limiter = LocalRateLimiter::with_clock(Algorithm::TokenBucket, clock.clone());
    let period = Duration::from_secs(10);

    for _ in 0..10 {
        assert!(assert_ok!(limiter.allow("client", 10, period).await).allowed);
    }
    let denied = assert_ok!(limiter.allow("client", 10, period).await);
    assert!(!denied.allowed);
    assert_eq!(denied.reset_after, Duration::from_secs(1));
}

#[tokio::test]
async fn breaker_opens_and_recovers() {
    let clock = ManualClock::new(START);
    let config = BreakerConfig {
        failure_threshold: 5,
        success_threshold: 2,
        open_timeout: Duration::from_secs(30),
        half_open_max_calls: 1,
    };
    let breaker: CircuitBreaker<std::io::Error> =
        assert_ok!(CircuitBreaker::new("payments", config)).with_clock(clock.clone());
    let calls = AtomicUsize::new(0);

    for _ in 0..5 {
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(std::io::Error::other("connection reset"))
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Inner(_))));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected = breaker
        .execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(matches!(rejected, Err(BreakerError::Open)));
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    clock.advance(Duration::from_secs(30));
    for _ in 0..2 {
        assert_ok!(breaker.execute(|| async { Ok(()) }).await);
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.counts().consecutive_failures, 0);
    assert_eq!(breaker.counts().consecutive_successes, 0);
}

#[tokio::test]
async fn fixed_window_allows_at_most_twice_the_limit_across_a_boundary() {
    let clock = ManualClock::new(START);
    let limiter = LocalRateLimiter::with_clock(Algorithm::FixedWindow, clock.clone());
    let period = Duration::from_secs(1);

    // the last 10ms of one window and the first 10ms of the next
    clock.advance(Duration::from_millis(990));
    let mut allowed = 0;
    for _ in 0..20 {
        if assert_ok!(limiter.allow("k", 5, period).await).allowed {
            allowed += 1;
        }
    }
    clock.advance(Duration::from_millis(20));
    for _ in 0..20 {
        if assert_ok!(limiter.allow("k", 5, period).await).allowed {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 10);
}

#[tokio::test]
async fn sliding_window_bounds_rolling_throughput() {
    let clock = ManualClock::new(START);
    let limiter = LocalRateLimiter::with_clock(Algorithm::SlidingWindow, clock.clone());
    let limit = 10;
    let period = Duration::from_secs(1);

    // one attempt every 10ms for 5s, recording the time of every admission
    let mut admitted_at = Vec::new();
    for step in 0..500u64 {
        if assert_ok!(limiter.allow("k", limit, period).await).allowed {
            admitted_at.push(step * 10);
        }
        clock.advance(Duration::from_millis(10));
    }

    for (i, start) in admitted_at.iter().enumerate() {
        let in_window = admitted_at[i..].iter().take_while(|t| **t < start + 1_000).count();
        assert!(in_window as u64 <= limit, "{in_window} admitted in the period from {start}ms");
    }
}

#[tokio::test]
async fn concurrent_callers_share_one_quota() {
    let limiter = Arc::new(LocalRateLimiter::with_clock(
        Algorithm::SlidingWindow,
        ManualClock::new(START),
    ));

    let calls = (0..200).map(|_| {
        let limiter = limiter.clone();
        async move { limiter.allow("shared", 50, Duration::from_secs(60)).await }
    });
    let allowed = join_all(calls)
        .await
        .into_iter()
        .filter(|result| result.as_ref().map(|d| d.allowed).unwrap_or(false))
        .count();
    assert_eq!(allowed, 50);
}

#[tokio::test]
async fn invalid_limits_are_errors_not_denials() {
    let limiter = LocalRateLimiter::new(Algorithm::LeakyBucket);
    assert_err!(limiter.allow("k", 0, Duration::from_secs(1)).await);
}

#[test]
fn ring_spreads_keys_and_respects_bound() {
    let ring = assert_ok!(HashRing::new(RingConfig::with_average_load(25.0)));
    for host in ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"] {
        ring.add(host);
    }
    let max_load = ring.max_load();

    // 4 hosts * 32 slots = 128; stay below saturation
    let mut picks: HashMap<String, u64> = HashMap::new();
    for i in 0..120 {
        let host = assert_ok!(ring.get(&format!("session-{i}")));
        *picks.entry(host).or_default() += 1;
    }
    assert_eq!(picks.len(), 4);
    for (host, count) in &picks {
        assert!(*count <= max_load, "{host} took {count} > {max_load}");
        assert_eq!(ring.load(host), Some(*count));
    }

    for (host, count) in picks {
        for _ in 0..count {
            ring.release(&host);
        }
    }
    for host in ring.hosts() {
        assert_eq!(ring.load(&host), Some(0));
    }
}

#[test]
fn ring_removal_only_moves_keys_of_removed_host() {
    let ring = assert_ok!(HashRing::new(RingConfig::default()));
    for host in ["a", "b", "c", "d", "e"] {
        ring.add(host);
    }
    let keys: Vec<String> = (0..1_000).map(|i| format!("user-{i}")).collect();
    let before: Vec<String> = keys.iter().map(|k| ring.locate(k).unwrap()).collect();

    ring.remove("c");
    for (key, owner) in keys.iter().zip(&before) {
        let now = ring.locate(key).unwrap();
        if owner != "c" {
            assert_eq!(&now, owner, "{key} moved although its host stayed");
        } else {
            assert_ne!(now, "c");
        }
    }
}
