//! Atomic store scripts for the distributed limiters.
//!
//! Each script performs read state, compute, write state as one unit. The
//! Lua source and the Rust `run` share one `KEYS`/`ARGV` layout and return
//! the same strings; the caller turns those into a
//! [`RateLimitDecision`](super::RateLimitDecision) with the same functions the
//! local limiter uses. Bucket levels are written with 17 significant digits so
//! they round-trip exactly.

use std::time::Duration;

use super::algorithm::{self, BucketState};
use crate::store::{key_at, parse_arg, parse_value, AtomicScript, ScriptContext, StoreResult};

/// `KEYS[1]` window counter; `ARGV[1]` ttl ms. Returns `{count}`.
pub(crate) struct FixedWindowScript;

impl AtomicScript for FixedWindowScript {
    fn name(&self) -> &'static str {
        "bulwark_fixed_window"
    }

    fn lua(&self) -> &'static str {
        r#"
        local count = redis.call("INCR", KEYS[1])
        if count == 1 then
            redis.call("PEXPIRE", KEYS[1], ARGV[1])
        end
        return {tostring(count)}
        "#
    }

    fn run(
        &self,
        ctx: &mut dyn ScriptContext,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Vec<String>> {
        let window_key = key_at(self.name(), keys, 0)?;
        let ttl_ms: u64 = parse_arg(self.name(), args, 0)?;

        let count = ctx.incr(window_key, 1)?;
        if count == 1 {
            ctx.expire(window_key, Duration::from_millis(ttl_ms))?;
        }
        Ok(vec![count.to_string()])
    }
}

/// `KEYS[1]` current window, `KEYS[2]` previous window;
/// `ARGV` limit, period ms, now ms, ttl ms.
/// Returns `{admitted, current, previous}` with counts read before admission.
pub(crate) struct SlidingWindowScript;

impl AtomicScript for SlidingWindowScript {
    fn name(&self) -> &'static str {
        "bulwark_sliding_window"
    }

    fn lua(&self) -> &'static str {
        r#"
        local limit = tonumber(ARGV[1])
        local period = tonumber(ARGV[2])
        local now = tonumber(ARGV[3])

        local current = tonumber(redis.call("GET", KEYS[1])) or 0
        local previous = tonumber(redis.call("GET", KEYS[2])) or 0

        local progress = (now % period) / period
        local weighted = current + previous * (1 - progress)

        local admitted = 0
        if weighted < limit then
            local count = redis.call("INCR", KEYS[1])
            if count == 1 then
                redis.call("PEXPIRE", KEYS[1], ARGV[4])
            end
            admitted = 1
        end

        return {tostring(admitted), tostring(current), tostring(previous)}
        "#
    }

    fn run(
        &self,
        ctx: &mut dyn ScriptContext,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Vec<String>> {
        let current_key = key_at(self.name(), keys, 0)?;
        let previous_key = key_at(self.name(), keys, 1)?;
        let limit: u64 = parse_arg(self.name(), args, 0)?;
        let period_ms: u64 = parse_arg(self.name(), args, 1)?;
        let now_ms: u64 = parse_arg(self.name(), args, 2)?;
        let ttl_ms: u64 = parse_arg(self.name(), args, 3)?;

        let current = parse_value::<u64>(current_key, ctx.get(current_key)?)?.unwrap_or(0);
        let previous = parse_value::<u64>(previous_key, ctx.get(previous_key)?)?.unwrap_or(0);

        let admitted = algorithm::sliding_admits(current, previous, now_ms, limit, period_ms);
        if admitted && ctx.incr(current_key, 1)? == 1 {
            ctx.expire(current_key, Duration::from_millis(ttl_ms))?;
        }

        Ok(vec![
            (admitted as u8).to_string(),
            current.to_string(),
            previous.to_string(),
        ])
    }
}

/// `KEYS[1]` level, `KEYS[2]` last update ms;
/// `ARGV` capacity, rate per second, now ms, ttl ms.
/// Returns `{allowed, tokens}`.
pub(crate) struct TokenBucketScript;

impl AtomicScript for TokenBucketScript {
    fn name(&self) -> &'static str {
        "bulwark_token_bucket"
    }

    fn lua(&self) -> &'static str {
        r#"
        local capacity = tonumber(ARGV[1])
        local rate = tonumber(ARGV[2])
        local now = tonumber(ARGV[3])

        local level = tonumber(redis.call("GET", KEYS[1]))
        local last = tonumber(redis.call("GET", KEYS[2]))
        if level == nil or last == nil then
            level = capacity
            last = now
        end

        local elapsed = math.max(0, now - last)
        last = math.max(last, now)
        level = math.min(level + (elapsed / 1000) * rate, capacity)

        local allowed = 0
        if level >= 1 - 1e-9 then
            level = math.max(level - 1, 0)
            allowed = 1
        end

        redis.call("SET", KEYS[1], string.format("%.17g", level), "PX", ARGV[4])
        redis.call("SET", KEYS[2], string.format("%d", last), "PX", ARGV[4])

        return {tostring(allowed), string.format("%.17g", level)}
        "#
    }

    fn run(
        &self,
        ctx: &mut dyn ScriptContext,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Vec<String>> {
        let (mut state, params) = load_bucket(self.name(), ctx, keys, args, BucketState::full)?;
        let allowed = algorithm::token_bucket_step(&mut state, params.now_ms, params.capacity, params.rate);
        store_bucket(ctx, keys, &state, params.ttl)?;
        Ok(vec![(allowed as u8).to_string(), state.level.to_string()])
    }
}

/// Same layout as [`TokenBucketScript`]. Returns `{allowed, level}`.
pub(crate) struct LeakyBucketScript;

impl AtomicScript for LeakyBucketScript {
    fn name(&self) -> &'static str {
        "bulwark_leaky_bucket"
    }

    fn lua(&self) -> &'static str {
        r#"
        local capacity = tonumber(ARGV[1])
        local rate = tonumber(ARGV[2])
        local now = tonumber(ARGV[3])

        local level = tonumber(redis.call("GET", KEYS[1]))
        local last = tonumber(redis.call("GET", KEYS[2]))
        if level == nil or last == nil then
            level = 0
            last = now
        end

        local elapsed = math.max(0, now - last)
        last = math.max(last, now)
        level = math.max(level - (elapsed / 1000) * rate, 0)

        local allowed = 0
        if level + 1 <= capacity + 1e-9 then
            level = math.min(level + 1, capacity)
            allowed = 1
        end

        redis.call("SET", KEYS[1], string.format("%.17g", level), "PX", ARGV[4])
        redis.call("SET", KEYS[2], string.format("%d", last), "PX", ARGV[4])

        return {tostring(allowed), string.format("%.17g", level)}
        "#
    }

    fn run(
        &self,
        ctx: &mut dyn ScriptContext,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Vec<String>> {
        let (mut state, params) =
            load_bucket(self.name(), ctx, keys, args, |_, now_ms| BucketState::empty(now_ms))?;
        let allowed = algorithm::leaky_bucket_step(&mut state, params.now_ms, params.capacity, params.rate);
        store_bucket(ctx, keys, &state, params.ttl)?;
        Ok(vec![(allowed as u8).to_string(), state.level.to_string()])
    }
}

struct BucketParams {
    capacity: f64,
    rate: f64,
    now_ms: u64,
    ttl: Duration,
}

fn load_bucket(
    script: &'static str,
    ctx: &mut dyn ScriptContext,
    keys: &[String],
    args: &[String],
    initial: impl FnOnce(f64, u64) -> BucketState,
) -> StoreResult<(BucketState, BucketParams)> {
    let level_key = key_at(script, keys, 0)?;
    let last_key = key_at(script, keys, 1)?;
    let params = BucketParams {
        capacity: parse_arg(script, args, 0)?,
        rate: parse_arg(script, args, 1)?,
        now_ms: parse_arg(script, args, 2)?,
        ttl: Duration::from_millis(parse_arg(script, args, 3)?),
    };

    let level = parse_value::<f64>(level_key, ctx.get(level_key)?)?;
    let last = parse_value::<u64>(last_key, ctx.get(last_key)?)?;
    let state = match (level, last) {
        (Some(level), Some(last_update_ms)) => BucketState {
            level,
            last_update_ms,
        },
        _ => initial(params.capacity, params.now_ms),
    };
    Ok((state, params))
}

fn store_bucket(
    ctx: &mut dyn ScriptContext,
    keys: &[String],
    state: &BucketState,
    ttl: Duration,
) -> StoreResult<()> {
    ctx.set(&keys[0], state.level.to_string(), Some(ttl))?;
    ctx.set(&keys[1], state.last_update_ms.to_string(), Some(ttl))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{KeyStore, MemoryStore};
    use std::sync::Arc;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        (clock.clone(), MemoryStore::with_clock(clock))
    }

    #[tokio::test]
    async fn test_fixed_window_script_sets_ttl_once() {
        let (clock, store) = store();
        let keys = strings(&["w"]);
        let args = strings(&["2000"]);

        let out = store.run_script(&FixedWindowScript, &keys, &args).await.unwrap();
        assert_eq!(out, strings(&["1"]));

        clock.advance(Duration::from_millis(500));
        let out = store.run_script(&FixedWindowScript, &keys, &args).await.unwrap();
        assert_eq!(out, strings(&["2"]));
        assert_eq!(store.ttl("w"), Some(Duration::from_millis(1500)));
    }

    #[tokio::test]
    async fn test_sliding_window_script_reports_counts_before_admission() {
        let (_, store) = store();
        store.set("prev", "4", None).await.unwrap();
        let keys = strings(&["cur", "prev"]);
        // now is at the start of a window, so the previous window weighs fully
        let args = strings(&["5", "1000", "1000000", "2000"]);

        let out = store.run_script(&SlidingWindowScript, &keys, &args).await.unwrap();
        assert_eq!(out, strings(&["1", "0", "4"]));

        let out = store.run_script(&SlidingWindowScript, &keys, &args).await.unwrap();
        assert_eq!(out, strings(&["0", "1", "4"]));
        assert_eq!(store.get("cur").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_token_bucket_script_persists_state() {
        let (_, store) = store();
        let keys = strings(&["level", "ts"]);
        let args = strings(&["2", "1", "1000000", "4000"]);

        for expected in ["1", "1", "0"] {
            let out = store.run_script(&TokenBucketScript, &keys, &args).await.unwrap();
            assert_eq!(out[0], expected);
        }
        assert_eq!(store.get("level").await.unwrap().as_deref(), Some("0"));
        assert_eq!(store.get("ts").await.unwrap().as_deref(), Some("1000000"));
    }

    #[tokio::test]
    async fn test_leaky_bucket_script_rejects_bad_state() {
        let (_, store) = store();
        store.set("level", "not-a-number", None).await.unwrap();
        store.set("ts", "1", None).await.unwrap();
        let keys = strings(&["level", "ts"]);
        let args = strings(&["2", "1", "1000000", "4000"]);

        let err = store
            .run_script(&LeakyBucketScript, &keys, &args)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::store::StoreError::InvalidValue { .. }));
    }

    #[tokio::test]
    async fn test_missing_arguments_are_script_errors() {
        let (_, store) = store();
        let err = store
            .run_script(&SlidingWindowScript, &strings(&["cur"]), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, crate::store::StoreError::Script { .. }));
    }
}
