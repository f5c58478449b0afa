//! Health state machine.
//!
//! # States
//! - Healthy: the active handler serves connections
//! - Unhealthy: the standby handler does
//!
//! # State Transitions
//! ```text
//! Healthy → Unhealthy: consecutive failures >= unhealthy_threshold
//! Unhealthy → Healthy: consecutive successes >= healthy_threshold
//! ```
//!
//! # Design Decisions
//! - Hysteresis prevents flapping
//! - Counters reset on every opposite result

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HealthState {
    Healthy = 0,
    Unhealthy = 1,
}

impl From<u8> for HealthState {
    fn from(v: u8) -> Self {
        match v {
            0 => HealthState::Healthy,
            _ => HealthState::Unhealthy,
        }
    }
}

#[derive(Debug)]
pub struct HealthTracker {
    state: AtomicU8,
    consecutive_successes: AtomicUsize,
    consecutive_failures: AtomicUsize,
    healthy_threshold: usize,
    unhealthy_threshold: usize,
}

impl HealthTracker {
    /// Thresholds below one are treated as one.
    pub fn new(initial: HealthState, healthy_threshold: usize, unhealthy_threshold: usize) -> Self {
        Self {
            state: AtomicU8::new(initial as u8),
            consecutive_successes: AtomicUsize::new(0),
            consecutive_failures: AtomicUsize::new(0),
            healthy_threshold: healthy_threshold.max(1),
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    pub fn state(&self) -> HealthState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == HealthState::Healthy
    }

    /// Record a check result. Returns the new state if this result caused a
    /// transition.
    pub fn record(&self, healthy: bool) -> Option<HealthState> {
        if healthy {
            self.mark_success()
        } else {
            self.mark_failure()
        }
    }

    fn mark_success(&self) -> Option<HealthState> {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self.is_healthy() {
            return None;
        }

        let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        if successes < self.healthy_threshold {
            return None;
        }
        self.transition(HealthState::Unhealthy, HealthState::Healthy)
    }

    fn mark_failure(&self) -> Option<HealthState> {
        self.consecutive_successes.store(0, Ordering::Relaxed);
        if !self.is_healthy() {
            return None;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures < self.unhealthy_threshold {
            return None;
        }
        self.transition(HealthState::Healthy, HealthState::Unhealthy)
    }

    fn transition(&self, from: HealthState, to: HealthState) -> Option<HealthState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.consecutive_successes.store(0, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        Some(to)
    }
}
