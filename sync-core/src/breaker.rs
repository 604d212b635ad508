//! Circuit breakers per (peer, operation kind).
//!
//! ```text
//! closed ──(threshold consecutive failures)──► open
//!   ▲                                           │ cooldown elapsed
//!   └──────── probe succeeds ◄── half-open ◄────┘
//!                                    │ probe fails
//!                                    └──────────► open
//! ```

use std::collections::HashMap;
use std::time::Duration;
use vitalsync_types::DeviceId;

use crate::queue::OperationKind;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls pass through.
    Closed {
        /// Consecutive failures so far.
        failures: u32,
    },
    /// Calls are rejected until `until` (ms).
    Open {
        /// End of the cooldown.
        until: u64,
    },
    /// One probe call is in flight.
    HalfOpen,
}

/// A single breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreaker {
    state: BreakerState,
    threshold: u32,
    cooldown_ms: u64,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed { failures: 0 },
            threshold,
            cooldown_ms: cooldown.as_millis() as u64,
        }
    }

    /// Whether a call may proceed now.
    ///
    /// An open breaker whose cooldown has passed lets exactly one probe
    /// through and goes half-open.
    pub fn allow(&mut self, now: u64) -> bool {
        match self.state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { until } if now >= until => {
                self.state = BreakerState::HalfOpen;
                true
            }
            BreakerState::Open { .. } | BreakerState::HalfOpen => false,
        }
    }

    /// Record a successful call.
    pub fn on_success(&mut self) {
        self.state = BreakerState::Closed { failures: 0 };
    }

    /// Record a failed call. Returns true if the breaker just opened.
    pub fn on_failure(&mut self, now: u64) -> bool {
        match self.state {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.threshold {
                    self.state = BreakerState::Open {
                        until: now + self.cooldown_ms,
                    };
                    true
                } else {
                    self.state = BreakerState::Closed { failures };
                    false
                }
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open {
                    until: now + self.cooldown_ms,
                };
                true
            }
            BreakerState::Open { .. } => false,
        }
    }

    /// Force closed.
    pub fn reset(&mut self) {
        self.state = BreakerState::Closed { failures: 0 };
    }

    /// Current state.
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether calls are currently rejected.
    pub fn is_open(&self) -> bool {
        matches!(self.state, BreakerState::Open { .. })
    }
}

/// All breakers, created lazily.
#[derive(Debug, Clone)]
pub struct BreakerRegistry {
    breakers: HashMap<(DeviceId, OperationKind), CircuitBreaker>,
    threshold: u32,
    cooldown: Duration,
}

impl BreakerRegistry {
    /// Create a registry whose breakers share the given settings.
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            breakers: HashMap::new(),
            threshold,
            cooldown,
        }
    }

    fn breaker(&mut self, peer: DeviceId, kind: OperationKind) -> &mut CircuitBreaker {
        let (threshold, cooldown) = (self.threshold, self.cooldown);
        self.breakers
            .entry((peer, kind))
            .or_insert_with(|| CircuitBreaker::new(threshold, cooldown))
    }

    /// Whether a call for this peer and kind may proceed.
    pub fn allow(&mut self, peer: DeviceId, kind: OperationKind, now: u64) -> bool {
        self.breaker(peer, kind).allow(now)
    }

    /// Record a success.
    pub fn on_success(&mut self, peer: DeviceId, kind: OperationKind) {
        self.breaker(peer, kind).on_success();
    }

    /// Record a failure. Returns true if the breaker just opened.
    pub fn on_failure(&mut self, peer: DeviceId, kind: OperationKind, now: u64) -> bool {
        self.breaker(peer, kind).on_failure(now)
    }

    /// Close one breaker.
    pub fn reset(&mut self, peer: DeviceId, kind: OperationKind) {
        if let Some(b) = self.breakers.get_mut(&(peer, kind)) {
            b.reset();
        }
    }

    /// Drop every breaker for a peer.
    pub fn remove_peer(&mut self, peer: &DeviceId) {
        self.breakers.retain(|(p, _), _| p != peer);
    }

    /// State of one breaker, if it exists.
    pub fn state(&self, peer: DeviceId, kind: OperationKind) -> Option<BreakerState> {
        self.breakers.get(&(peer, kind)).map(CircuitBreaker::state)
    }

    /// Every breaker that is currently open.
    pub fn open_breakers(&self) -> Vec<(DeviceId, OperationKind)> {
        self.breakers
            .iter()
            .filter(|(_, b)| b.is_open())
            .map(|(k, _)| *k)
            .collect()
    }
}
