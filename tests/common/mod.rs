//! Local-versus-distributed simulation shared by the store integration tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bulwark::clock::ManualClock;
use bulwark::ratelimit::{Algorithm, DistributedRateLimiter, LocalRateLimiter, RateLimiter};
use bulwark::store::KeyStore;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const KEYS: [(&str, u64, Duration); 4] = [
    ("alpha", 3, Duration::from_millis(500)),
    ("beta", 10, Duration::from_secs(1)),
    ("gamma", 7, Duration::from_millis(1_300)),
    ("delta", 25, Duration::from_secs(4)),
];

/// Drive a local limiter and a limiter over `store` with the same seeded
/// calls and assert every decision matches. `clock` must be the clock the
/// store expires keys by, if it has one.
pub async fn simulate(
    store: Arc<dyn KeyStore>,
    clock: Arc<ManualClock>,
    prefix: &str,
    algorithm: Algorithm,
    seed: u64,
    steps: usize,
) {
    let local = LocalRateLimiter::with_clock(algorithm, clock.clone());
    let distributed = DistributedRateLimiter::new(store, algorithm)
        .with_prefix(prefix)
        .with_clock(clock.clone());
    let mut rng = StdRng::seed_from_u64(seed);

    let mut last_step = Instant::now();
    let mut allowed = 0;
    for step in 0..steps {
        // mostly short gaps, sometimes long enough for stored state to expire
        let gap_ms = if rng.gen_ratio(1, 50) {
            rng.gen_range(2_000..10_000)
        } else {
            rng.gen_range(0..40)
        };
        // every step advances at least as far as wall time did, so a
        // server-side TTL never fires before the simulated one
        let gap_ms = gap_ms.max(last_step.elapsed().as_millis() as u64 + 1);
        last_step = Instant::now();
        clock.advance(Duration::from_millis(gap_ms));

        let (key, limit, period) = KEYS[rng.gen_range(0..KEYS.len())];
        let expected = local.allow(key, limit, period).await.unwrap();
        let actual = distributed.allow(key, limit, period).await.unwrap();
        assert_eq!(
            expected, actual,
            "{algorithm} diverged at step {step} for {key} (seed {seed})"
        );
        if expected.allowed {
            allowed += 1;
        }
    }

    // the run must exercise both outcomes to mean anything
    assert!(allowed > 0 && allowed < steps, "{algorithm}: {allowed}/{steps} allowed");
}
