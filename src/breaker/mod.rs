//! Circuit breaker.
//!
//! A [`CircuitBreaker`] wraps calls to one dependency. After
//! `failure_threshold` consecutive failures it opens and rejects calls with
//! [`BreakerError::Open`] without running them. Once `open_timeout` has
//! passed, the next call moves it to half-open and runs as a probe;
//! `success_threshold` successful probes close it again, and any failed probe
//! reopens it.
//!
//! The breaker only sees the errors its failure policy classifies as
//! infrastructure failures. Business errors (not found, validation) should be
//! excluded by the caller through [`CircuitBreaker::with_failure_policy`].

mod state;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use state::{BreakerCounts, CircuitState};
use state::{Machine, Permit, Transition};

use crate::clock::{self, Clock};
use crate::error::{BulwarkError, Result};

type StateCallback = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;
type FailurePolicy<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Successful probes that close a half-open circuit
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Time an open circuit waits before probing
    #[serde(
        default = "default_open_timeout",
        rename = "open_timeout_ms",
        with = "crate::config::duration_ms"
    )]
    pub open_timeout: Duration,

    /// Probe calls allowed to run at once while half-open
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout: default_open_timeout(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_half_open_max_calls() -> u32 {
    1
}

impl BreakerConfig {
    /// Check that every threshold is at least one.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("failure_threshold", self.failure_threshold),
            ("success_threshold", self.success_threshold),
            ("half_open_max_calls", self.half_open_max_calls),
        ] {
            if value == 0 {
                return Err(BulwarkError::InvalidArgument(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    /// The circuit is open; the operation was not run.
    #[error("circuit breaker is open")]
    Open,

    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Whether the call was rejected by the breaker.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open)
    }

    /// The operation's own error, if it ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Open => None,
            BreakerError::Inner(err) => Some(err),
        }
    }
}

/// A circuit breaker guarding one dependency whose calls fail with `E`.
pub struct CircuitBreaker<E> {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    machine: Mutex<Machine>,
    on_state_change: Option<StateCallback>,
    failure_policy: Option<FailurePolicy<E>>,
}

impl<E> CircuitBreaker<E> {
    /// Create a closed breaker named `name`.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            clock: clock::system(),
            machine: Mutex::new(Machine::new()),
            on_state_change: None,
            failure_policy: None,
        })
    }

    /// Read time from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Call `callback(name, from, to)` after every state change. The
    /// breaker's lock is not held during the call.
    pub fn on_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(callback));
        self
    }

    /// Count only errors for which `policy` returns true as failures. Other
    /// errors are passed through and count as successes. Without a policy
    /// every `Err` is a failure.
    pub fn with_failure_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.failure_policy = Some(Arc::new(policy));
        self
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state.
    ///
    /// An open circuit whose timeout has elapsed still reads `Open` until
    /// the next call moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.machine.lock().state()
    }

    /// Current consecutive failure and success counts.
    pub fn counts(&self) -> BreakerCounts {
        self.machine.lock().counts()
    }

    /// Run `operation` unless the circuit is open.
    ///
    /// Cancelling the returned future while `operation` runs records no
    /// outcome and frees the probe slot it held.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> std::result::Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let permit = self.acquire()?;
        let call = CallGuard {
            breaker: self,
            permit,
            finished: false,
        };

        let result = operation().await;
        let failed = match &result {
            Ok(_) => false,
            Err(err) => self.failure_policy.as_ref().map_or(true, |policy| policy(err)),
        };
        call.finish(failed);

        result.map_err(BreakerError::Inner)
    }

    fn acquire(&self) -> std::result::Result<Permit, BreakerError<E>> {
        let (permit, transition) = {
            let mut machine = self.machine.lock();
            machine.acquire(&self.config, self.clock.now_ms())
        };
        if let Some(transition) = transition {
            self.notify(transition);
        }

        permit.ok_or_else(|| {
            debug!(breaker = %self.name, "Circuit open, rejecting call");
            BreakerError::Open
        })
    }

    fn record(&self, permit: Permit, failed: bool) {
        let transition = {
            let mut machine = self.machine.lock();
            machine.record(&self.config, permit, failed, self.clock.now_ms())
        };
        if let Some(transition) = transition {
            self.notify(transition);
        }
    }

    fn notify(&self, transition: Transition) {
        match transition.to {
            CircuitState::Open => warn!(
                breaker = %self.name,
                from = ?transition.from,
                to = ?transition.to,
                "Circuit breaker opened"
            ),
            _ => info!(
                breaker = %self.name,
                from = ?transition.from,
                to = ?transition.to,
                "Circuit breaker state changed"
            ),
        }
        if let Some(callback) = &self.on_state_change {
            callback(&self.name, transition.from, transition.to);
        }
    }
}

/// Gives the permit back if the call is dropped before it finishes.
struct CallGuard<'a, E> {
    breaker: &'a CircuitBreaker<E>,
    permit: Permit,
    finished: bool,
}

impl<E> CallGuard<'_, E> {
    fn finish(mut self, failed: bool) {
        self.finished = true;
        self.breaker.record(self.permit, failed);
    }
}

impl<E> Drop for CallGuard<'_, E> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(breaker = %self.breaker.name, "Call cancelled before completion");
            self.breaker.machine.lock().cancel(self.permit);
        }
    }
}
