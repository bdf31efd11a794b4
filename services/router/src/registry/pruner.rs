use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use super::RouteRegistry;
use crate::bus::BusStatus;

/// Settings for the stale-route sweep.
#[derive(Debug, Clone)]
pub struct PruneConfig {
    /// Time between sweeps. Endpoints are judged against the registry's
    /// stale threshold, not this interval.
    pub interval: Duration,
    /// Skip pruning while the message bus is unreachable.
    pub suspend_on_bus_unavailable: bool,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            suspend_on_bus_unavailable: false,
        }
    }
}

/// What a single prune tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneTick {
    /// Bus unavailable and suspension enabled; nothing evicted.
    Suspended,
    /// First tick after a suspension. Heartbeats were reset before pruning.
    Resumed {
        /// Endpoints evicted on the resuming sweep.
        pruned: usize,
    },
    /// Normal sweep; carries the number of endpoints evicted.
    Pruned(usize),
}

/// Periodically evicts endpoints whose heartbeats have lapsed.
pub struct Pruner {
    registry: Arc<RouteRegistry>,
    config: PruneConfig,
    bus_status: watch::Receiver<BusStatus>,
    suspended: bool,
}

impl Pruner {
    pub fn new(
        registry: Arc<RouteRegistry>,
        config: PruneConfig,
        bus_status: watch::Receiver<BusStatus>,
    ) -> Self {
        Self {
            registry,
            config,
            bus_status,
            suspended: false,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            stale_threshold_secs = self.registry.stale_threshold().as_secs(),
            suspend_on_bus_unavailable = self.config.suspend_on_bus_unavailable,
            "Starting route pruner"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Route pruner shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one prune cycle, honoring bus-outage suspension.
    pub async fn tick(&mut self) -> PruneTick {
        let bus_down = *self.bus_status.borrow() == BusStatus::Unavailable;

        if bus_down && self.config.suspend_on_bus_unavailable {
            if !self.suspended {
                warn!("Message bus unavailable; suspending route pruning");
                self.suspended = true;
            }
            return PruneTick::Suspended;
        }

        if self.suspended {
            self.suspended = false;
            self.registry.freshen_all().await;
            info!("Message bus available; resuming route pruning");
            let pruned = self.registry.prune_cycle().await.len();
            return PruneTick::Resumed { pruned };
        }

        let pruned = self.registry.prune_cycle().await.len();
        if pruned > 0 {
            info!(pruned, "Prune pass complete");
        }
        PruneTick::Pruned(pruned)
    }
}
