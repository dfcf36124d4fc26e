//! Per-provider circuit breaker
//!
//! Consecutive failures trip the circuit open for a cooldown period; after
//! the cooldown a half-open probe lets traffic through, and enough successes
//! close it again. Any failure while half-open re-opens immediately.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed (normal operation)
    Closed,
    /// Circuit is open (rejecting dispatches)
    Open,
    /// Circuit is testing (allowing limited dispatches)
    HalfOpen,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self::Closed
    }
}

/// Configuration for circuit breakers
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Time before transitioning from open to half-open
    pub cooldown: Duration,
    /// Successes in half-open before closing
    pub half_open_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            half_open_successes: 1,
        }
    }
}

/// Circuit breaker guarding one provider
pub struct CircuitBreaker {
    state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            config,
        }
    }

    /// Check if a dispatch should be allowed, transitioning Open -> HalfOpen
    /// once the cooldown has elapsed.
    pub fn allow_request(&self) -> bool {
        let state = *self.state.read();

        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if let Some(opened_at) = *self.opened_at.read() {
                    if opened_at.elapsed() >= self.config.cooldown {
                        *self.state.write() = CircuitState::HalfOpen;
                        self.half_open_successes.store(0, Ordering::SeqCst);
                        debug!("Circuit breaker transitioning to half-open");
                        return true;
                    }
                }
                false
            }
            CircuitState::HalfOpen => true,
        }
    }

    /// Record a successful dispatch
    pub fn record_success(&self) {
        let state = *self.state.read();

        match state {
            CircuitState::HalfOpen => {
                let count = self.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.config.half_open_successes {
                    *self.state.write() = CircuitState::Closed;
                    *self.opened_at.write() = None;
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    info!("Circuit breaker closed after {} successes", count);
                }
            }
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed dispatch
    pub fn record_failure(&self) {
        let state = *self.state.read();

        match state {
            CircuitState::Closed => {
                let count = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.config.failure_threshold {
                    *self.state.write() = CircuitState::Open;
                    *self.opened_at.write() = Some(Instant::now());
                    warn!("Circuit breaker opened after {} consecutive failures", count);
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open immediately re-opens
                *self.state.write() = CircuitState::Open;
                *self.opened_at.write() = Some(Instant::now());
                self.half_open_successes.store(0, Ordering::SeqCst);
                warn!("Circuit breaker re-opened on failure in half-open state");
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Remaining cooldown while open; `None` when not open or already due.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        if *self.state.read() != CircuitState::Open {
            return None;
        }
        let opened_at = (*self.opened_at.read())?;
        self.config.cooldown.checked_sub(opened_at.elapsed())
    }

    /// Force the breaker closed (operator action)
    pub fn reset(&self) {
        *self.state.write() = CircuitState::Closed;
        *self.opened_at.write() = None;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.half_open_successes.store(0, Ordering::SeqCst);
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
