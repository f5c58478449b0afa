//! Flips a server between an active and a standby handler.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::handler::{catch_panic, RejectHandler, SharedHandler, SwitchableHandler};
use crate::health::{HealthCheck, HealthState, HealthTracker};

pub const DEFAULT_HEALTHY_THRESHOLD: usize = 2;
pub const DEFAULT_UNHEALTHY_THRESHOLD: usize = 3;

/// Shorter check intervals are raised to this.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Owns the switch point a server is given in place of its real handler.
pub struct HealthGate {
    switch: Arc<SwitchableHandler>,
    active: SharedHandler,
    standby: SharedHandler,
    tracker: HealthTracker,
}

impl HealthGate {
    /// A gate on standby, rejecting connections until `active` proves healthy.
    pub fn new(active: SharedHandler) -> Self {
        Self::with_standby(active, Arc::new(RejectHandler))
    }

    pub fn with_standby(active: SharedHandler, standby: SharedHandler) -> Self {
        Self {
            switch: Arc::new(SwitchableHandler::new(standby.clone())),
            active,
            standby,
            tracker: HealthTracker::new(
                HealthState::Unhealthy,
                DEFAULT_HEALTHY_THRESHOLD,
                DEFAULT_UNHEALTHY_THRESHOLD,
            ),
        }
    }

    pub fn with_thresholds(mut self, healthy: usize, unhealthy: usize) -> Self {
        self.tracker = HealthTracker::new(self.tracker.state(), healthy, unhealthy);
        self
    }

    /// The handler to give to a server.
    pub fn handler(&self) -> SharedHandler {
        self.switch.clone()
    }

    pub fn state(&self) -> HealthState {
        self.tracker.state()
    }

    /// Feed one check result. Swaps the handler on a transition.
    pub fn report(&self, healthy: bool) -> Option<HealthState> {
        let changed = self.tracker.record(healthy)?;
        match changed {
            HealthState::Healthy => {
                self.switch.set(self.active.clone());
                tracing::info!("Health gate activated");
            }
            HealthState::Unhealthy => {
                self.switch.set(self.standby.clone());
                tracing::warn!("Health gate on standby");
            }
        }
        Some(changed)
    }

    /// Run `check` every `interval` until `token` is cancelled.
    pub async fn run<C: HealthCheck + ?Sized>(
        &self,
        check: &C,
        interval: Duration,
        token: CancellationToken,
    ) {
        let interval = interval.max(MIN_CHECK_INTERVAL);
        tracing::info!(interval_ms = interval.as_millis() as u64, "Health gate starting");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Health gate received shutdown signal, exiting loop");
                    break;
                }
                _ = ticker.tick() => {
                    // a panicking probe counts as a failure
                    let healthy = catch_panic("health_check", check.check()).await.unwrap_or(false);
                    self.report(healthy);
                }
            }
        }
    }
}

impl std::fmt::Debug for HealthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthGate")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
