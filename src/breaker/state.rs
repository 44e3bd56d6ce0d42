//! Breaker state machine.
//!
//! ```text
//! Closed   --failures >= failure_threshold-->  Open
//! Open     --open_timeout elapsed, next call-> HalfOpen
//! HalfOpen --successes >= success_threshold--> Closed
//! HalfOpen --any failure-->                    Open
//! ```
//!
//! Every transition starts a new generation. A call remembers the generation
//! it was admitted under and its outcome is dropped if the breaker has moved
//! on since.

use serde::{Deserialize, Serialize};

use super::BreakerConfig;

/// The three breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls run; failures are counted.
    Closed,
    /// Calls are rejected without running.
    Open,
    /// A limited number of probe calls run to test recovery.
    HalfOpen,
}

impl CircuitState {
    /// Whether the transition `self -> to` is in the table above.
    pub fn can_transition_to(self, to: CircuitState) -> bool {
        matches!(
            (self, to),
            (CircuitState::Closed, CircuitState::Open)
                | (CircuitState::Open, CircuitState::HalfOpen)
                | (CircuitState::HalfOpen, CircuitState::Closed)
                | (CircuitState::HalfOpen, CircuitState::Open)
        )
    }

    /// Lowercase state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consecutive outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakerCounts {
    /// Failures since the last success (Closed) or since the circuit opened
    pub consecutive_failures: u32,
    /// Successful probes in the current HalfOpen period
    pub consecutive_successes: u32,
}

/// A state change, reported once the lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Admission ticket for one call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Permit {
    generation: u64,
    probe: bool,
}

#[derive(Debug)]
pub(crate) struct Machine {
    state: CircuitState,
    counts: BreakerCounts,
    opened_at_ms: u64,
    probes_in_flight: u32,
    generation: u64,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            counts: BreakerCounts::default(),
            opened_at_ms: 0,
            probes_in_flight: 0,
            generation: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn counts(&self) -> BreakerCounts {
        self.counts
    }

    /// Admit a call or reject it. The returned transition is the
    /// Open -> HalfOpen move made on the way in, if any.
    pub fn acquire(
        &mut self,
        config: &BreakerConfig,
        now_ms: u64,
    ) -> (Option<Permit>, Option<Transition>) {
        let mut transition = None;

        if self.state == CircuitState::Open {
            let open_timeout_ms = config.open_timeout.as_millis() as u64;
            if now_ms.saturating_sub(self.opened_at_ms) < open_timeout_ms {
                return (None, None);
            }
            transition = Some(self.transition(CircuitState::HalfOpen, now_ms));
        }

        let permit = match self.state {
            CircuitState::Closed => Some(Permit {
                generation: self.generation,
                probe: false,
            }),
            CircuitState::HalfOpen if self.probes_in_flight < config.half_open_max_calls => {
                self.probes_in_flight += 1;
                Some(Permit {
                    generation: self.generation,
                    probe: true,
                })
            }
            _ => None,
        };
        (permit, transition)
    }

    /// Record the outcome of a call admitted with `permit`.
    pub fn record(
        &mut self,
        config: &BreakerConfig,
        permit: Permit,
        failed: bool,
        now_ms: u64,
    ) -> Option<Transition> {
        if permit.generation != self.generation {
            return None;
        }
        self.release(permit);

        match (self.state, failed) {
            (CircuitState::Closed, false) => {
                self.counts.consecutive_failures = 0;
                None
            }
            (CircuitState::Closed, true) => {
                self.counts.consecutive_failures += 1;
                (self.counts.consecutive_failures >= config.failure_threshold)
                    .then(|| self.transition(CircuitState::Open, now_ms))
            }
            (CircuitState::HalfOpen, false) => {
                self.counts.consecutive_successes += 1;
                (self.counts.consecutive_successes >= config.success_threshold)
                    .then(|| self.transition(CircuitState::Closed, now_ms))
            }
            (CircuitState::HalfOpen, true) => {
                self.counts.consecutive_failures += 1;
                Some(self.transition(CircuitState::Open, now_ms))
            }
            // no permit is ever issued while Open
            (CircuitState::Open, _) => None,
        }
    }

    /// Give back a permit whose call never finished.
    pub fn cancel(&mut self, permit: Permit) {
        if permit.generation == self.generation {
            self.release(permit);
        }
    }

    fn release(&mut self, permit: Permit) {
        if permit.probe {
            self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
        }
    }

    fn transition(&mut self, to: CircuitState, now_ms: u64) -> Transition {
        let from = self.state;
        assert!(
            from.can_transition_to(to),
            "invalid circuit breaker transition {from} -> {to}"
        );

        match to {
            CircuitState::Open => {
                self.opened_at_ms = now_ms;
                self.counts.consecutive_successes = 0;
            }
            CircuitState::HalfOpen | CircuitState::Closed => {
                self.counts = BreakerCounts::default();
            }
        }
        self.state = to;
        self.probes_in_flight = 0;
        self.generation += 1;
        Transition { from, to }
    }
}
