//! Global circuit breaker.
//!
//! The breaker is touched by every request, so its counters are plain
//! atomics. The mutex is only taken for state transitions, which are rare.
//! Transitions out of `Open` happen lazily: the first request evaluated
//! after the open timeout moves the breaker to `HalfOpen`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CircuitConfig;
use crate::error::{DdosError, DdosResult};
use crate::events::{EventSink, ProtectionEvent, TracingSink};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal admission.
    Closed,
    /// Shedding all load.
    Open,
    /// Admitting a limited number of trial requests.
    HalfOpen,
}

impl CircuitState {
    /// Header-friendly name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an admitted request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The handler produced a non-5xx response.
    Success,
    /// The handler failed or produced a 5xx response.
    Failure,
    /// The request was dropped before completing.
    Cancelled,
}

/// Snapshot of breaker counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    /// Current state.
    pub state: CircuitState,
    /// Requests in flight.
    pub concurrent: u64,
    /// Requests admitted in the current second.
    pub rps_current: u64,
    /// Configured concurrency ceiling.
    pub max_concurrent: u64,
    /// Configured rate ceiling.
    pub max_rps: u64,
    /// Requests evaluated.
    pub total_requests: u64,
    /// Requests rejected.
    pub rejected_requests: u64,
    /// Requests that completed successfully.
    pub successful_requests: u64,
    /// Times the breaker opened.
    pub openings: u64,
}

/// Global load-shedding gate.
#[derive(Debug)]
pub struct CircuitBreaker {
    max_concurrent: u64,
    max_rps: u64,
    open_timeout: Duration,
    half_open_max_trials: u32,
    /// Reference point for millisecond/second offsets.
    epoch: Instant,
    state: AtomicU8,
    /// Bumped on every transition so stale trial tickets are ignored.
    generation: AtomicU64,
    concurrent: AtomicU64,
    /// Second index (since `epoch`) the rate counter belongs to.
    rps_window: AtomicU64,
    rps_count: AtomicU64,
    opened_at_ms: AtomicU64,
    trials_in_flight: AtomicU32,
    total: AtomicU64,
    rejected: AtomicU64,
    successes: AtomicU64,
    openings: AtomicU64,
    transition: Mutex<()>,
    events: Arc<dyn EventSink>,
}

impl CircuitBreaker {
    /// Create a breaker that logs transitions through `tracing`.
    #[must_use]
    pub fn new(config: &CircuitConfig) -> Self {
        Self::with_events(config, Arc::new(TracingSink))
    }

    /// Create a breaker that reports transitions to the given sink.
    #[must_use]
    pub fn with_events(config: &CircuitConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            max_rps: config.max_rps,
            open_timeout: config.open_timeout(),
            half_open_max_trials: config.half_open_max_trials.max(1),
            epoch: Instant::now(),
            state: AtomicU8::new(CircuitState::Closed.to_u8()),
            generation: AtomicU64::new(0),
            concurrent: AtomicU64::new(0),
            rps_window: AtomicU64::new(0),
            rps_count: AtomicU64::new(0),
            opened_at_ms: AtomicU64::new(0),
            trials_in_flight: AtomicU32::new(0),
            total: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            openings: AtomicU64::new(0),
            transition: Mutex::new(()),
            events,
        }
    }

    /// Current state, without evaluating any pending transition.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Requests currently in flight.
    #[must_use]
    pub fn concurrent(&self) -> u64 {
        self.concurrent.load(Ordering::Acquire)
    }

    /// Admit a request, returning a guard that must live until it completes.
    ///
    /// # Errors
    ///
    /// Returns `DdosError::Overloaded` when the breaker is open, when the
    /// half-open trial budget is used up, or when this request trips it.
    pub fn enter(self: &Arc<Self>) -> DdosResult<InFlight> {
        self.enter_at(Instant::now())
    }

    /// [`enter`](Self::enter) at a given instant.
    ///
    /// # Errors
    ///
    /// See [`enter`](Self::enter).
    pub fn enter_at(self: &Arc<Self>, now: Instant) -> DdosResult<InFlight> {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.roll_window(now);

        let mut state = self.state();
        if state == CircuitState::Open {
            if self.open_elapsed(now) < self.open_timeout {
                return Err(self.reject(CircuitState::Open));
            }
            self.half_open(now);
            state = self.state();
        }

        let trial = match state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen => {
                let max = self.half_open_max_trials;
                let reserved = self
                    .trials_in_flight
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| (t < max).then_some(t + 1))
                    .is_ok();
                if !reserved {
                    return Err(self.reject(CircuitState::HalfOpen));
                }
                true
            }
            // Another request re-opened it between the load and here.
            CircuitState::Open => return Err(self.reject(CircuitState::Open)),
        };
        let generation = self.generation.load(Ordering::Acquire);

        let concurrent = self.concurrent.fetch_add(1, Ordering::AcqRel) + 1;
        let rps = self.rps_count.fetch_add(1, Ordering::AcqRel) + 1;

        if concurrent > self.max_concurrent || rps > self.max_rps {
            self.release_concurrent();
            if trial {
                self.release_trial(generation);
            }
            let reason = if concurrent > self.max_concurrent {
                "concurrent limit exceeded"
            } else {
                "rps limit exceeded"
            };
            self.trip(now, reason, concurrent, rps);
            return Err(self.reject(CircuitState::Open));
        }

        Ok(InFlight {
            breaker: Arc::clone(self),
            trial,
            generation,
            completion: Completion::Cancelled,
        })
    }

    /// Force the breaker back to `Closed`.
    pub fn reset(&self) {
        let changed = {
            let _guard = self.transition.lock();
            let changed = self.state() != CircuitState::Closed;
            self.state.store(CircuitState::Closed.to_u8(), Ordering::Release);
            self.generation.fetch_add(1, Ordering::AcqRel);
            self.trials_in_flight.store(0, Ordering::Release);
            changed
        };
        if changed {
            self.events.emit(ProtectionEvent::CircuitClosed);
        }
    }

    /// Snapshot of counters.
    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        self.stats_at(Instant::now())
    }

    /// Snapshot of counters at a given instant.
    #[must_use]
    pub fn stats_at(&self, now: Instant) -> CircuitStats {
        let rps_current = if self.rps_window.load(Ordering::Acquire) == self.second_index(now) {
            self.rps_count.load(Ordering::Acquire)
        } else {
            0
        };
        CircuitStats {
            state: self.state(),
            concurrent: self.concurrent(),
            rps_current,
            max_concurrent: self.max_concurrent,
            max_rps: self.max_rps,
            total_requests: self.total.load(Ordering::Relaxed),
            rejected_requests: self.rejected.load(Ordering::Relaxed),
            successful_requests: self.successes.load(Ordering::Relaxed),
            openings: self.openings.load(Ordering::Relaxed),
        }
    }

    fn complete(&self, trial: bool, generation: u64, completion: Completion, now: Instant) {
        self.release_concurrent();
        if completion == Completion::Success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        }
        if !trial || self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        match completion {
            Completion::Success => self.close(generation),
            Completion::Failure => {
                let concurrent = self.concurrent();
                self.trip(now, "trial request failed", concurrent, 0);
            }
            Completion::Cancelled => self.release_trial(generation),
        }
    }

    fn second_index(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_secs()
    }

    fn millis_since_epoch(&self, now: Instant) -> u64 {
        u64::try_from(now.saturating_duration_since(self.epoch).as_millis()).unwrap_or(u64::MAX)
    }

    fn open_elapsed(&self, now: Instant) -> Duration {
        let opened = self.opened_at_ms.load(Ordering::Acquire);
        Duration::from_millis(self.millis_since_epoch(now).saturating_sub(opened))
    }

    /// Start a fresh one-second rate window when the clock has moved on.
    fn roll_window(&self, now: Instant) {
        let second = self.second_index(now);
        let current = self.rps_window.load(Ordering::Acquire);
        if second > current
            && self
                .rps_window
                .compare_exchange(current, second, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.rps_count.store(0, Ordering::Release);
        }
    }

    fn release_concurrent(&self) {
        let _ = self
            .concurrent
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
    }

    fn release_trial(&self, generation: u64) {
        if self.generation.load(Ordering::Acquire) == generation {
            let _ = self
                .trials_in_flight
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| t.checked_sub(1));
        }
    }

    fn reject(&self, state: CircuitState) -> DdosError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(state = %state, "Circuit breaker rejected request");
        DdosError::Overloaded { state }
    }

    fn trip(&self, now: Instant, reason: &str, concurrent: u64, rps: u64) {
        let tripped = {
            let _guard = self.transition.lock();
            if self.state() == CircuitState::Open {
                false
            } else {
                self.opened_at_ms
                    .store(self.millis_since_epoch(now), Ordering::Release);
                self.generation.fetch_add(1, Ordering::AcqRel);
                self.state.store(CircuitState::Open.to_u8(), Ordering::Release);
                self.openings.fetch_add(1, Ordering::Relaxed);
                true
            }
        };
        if tripped {
            self.events.emit(ProtectionEvent::CircuitOpened {
                reason: reason.to_string(),
                concurrent,
                rps,
            });
        }
    }

    fn half_open(&self, now: Instant) {
        let moved = {
            let _guard = self.transition.lock();
            if self.state() == CircuitState::Open && self.open_elapsed(now) >= self.open_timeout {
                self.trials_in_flight.store(0, Ordering::Release);
                self.generation.fetch_add(1, Ordering::AcqRel);
                self.state.store(CircuitState::HalfOpen.to_u8(), Ordering::Release);
                true
            } else {
                false
            }
        };
        if moved {
            self.events.emit(ProtectionEvent::CircuitHalfOpened);
        }
    }

    fn close(&self, generation: u64) {
        let closed = {
            let _guard = self.transition.lock();
            if self.state() == CircuitState::HalfOpen
                && self.generation.load(Ordering::Acquire) == generation
            {
                self.generation.fetch_add(1, Ordering::AcqRel);
                self.trials_in_flight.store(0, Ordering::Release);
                self.state.store(CircuitState::Closed.to_u8(), Ordering::Release);
                true
            } else {
                false
            }
        };
        if closed {
            self.events.emit(ProtectionEvent::CircuitClosed);
        }
    }
}

/// In-flight marker for an admitted request.
///
/// Dropping it releases the request's concurrency slot exactly once. Call
/// [`finish`](Self::finish) to report the outcome; a guard dropped without
/// it counts as cancelled.
#[derive(Debug)]
#[must_use = "dropping the guard immediately ends the request"]
pub struct InFlight {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    generation: u64,
    completion: Completion,
}

impl InFlight {
    /// Whether this request is a half-open trial.
    #[must_use]
    pub const fn is_trial(&self) -> bool {
        self.trial
    }

    /// Report the outcome and release the slot.
    pub fn finish(mut self, success: bool) {
        self.completion = if success {
            Completion::Success
        } else {
            Completion::Failure
        };
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.breaker
            .complete(self.trial, self.generation, self.completion, Instant::now());
    }
}
