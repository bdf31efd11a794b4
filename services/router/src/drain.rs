//! Graceful drain coordination.
//!
//! `Running -> Draining -> Stopped`. Entering `Draining` closes listeners and
//! asks idle keep-alive connections to finish; in-flight requests and open
//! tunnels keep going until they finish or the drain timeout passes, at
//! which point `Stopped` force-closes whatever is left.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Running,
    Draining,
    Stopped,
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// All tracked work finished before the timeout.
    Completed,
    /// The timeout passed with work still open; it was force-closed.
    TimedOut { remaining: usize },
}

pub struct DrainCoordinator {
    state: watch::Sender<DrainState>,
    in_flight: watch::Sender<usize>,
    timeout: Duration,
}

impl DrainCoordinator {
    pub fn new(timeout: Duration) -> Arc<Self> {
        let (state, _) = watch::channel(DrainState::Running);
        let (in_flight, _) = watch::channel(0);
        Arc::new(Self {
            state,
            in_flight,
            timeout,
        })
    }

    pub fn state(&self) -> DrainState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == DrainState::Running
    }

    pub fn subscribe(&self) -> watch::Receiver<DrainState> {
        self.state.subscribe()
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Count a connection or tunnel until the guard drops.
    pub fn track(self: &Arc<Self>) -> DrainGuard {
        self.in_flight.send_modify(|n| *n += 1);
        DrainGuard {
            coordinator: Arc::clone(self),
        }
    }

    /// Enter `Draining`. Returns `false` if a drain was already under way.
    pub fn begin_drain(&self) -> bool {
        let started = self.state.send_if_modified(|state| {
            if *state == DrainState::Running {
                *state = DrainState::Draining;
                true
            } else {
                false
            }
        });

        if started {
            info!(
                in_flight = self.in_flight(),
                timeout_secs = self.timeout.as_secs(),
                "Drain started; listeners closing"
            );
        } else {
            info!(state = ?self.state(), "Drain already in progress; ignoring signal");
        }
        started
    }

    /// Wait for tracked work to finish, then stop.
    ///
    /// Starts a drain if none is under way. Work still open when the drain
    /// timeout passes is force-closed.
    pub async fn wait_drained(&self) -> DrainOutcome {
        if self.is_running() {
            self.begin_drain();
        }

        let mut in_flight = self.in_flight.subscribe();
        let completed = matches!(
            tokio::time::timeout(self.timeout, in_flight.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );

        let outcome = if completed {
            info!("Drain complete");
            DrainOutcome::Completed
        } else {
            let remaining = self.in_flight();
            warn!(remaining, "Drain timed out; closing remaining connections");
            DrainOutcome::TimedOut { remaining }
        };
        self.stop();
        outcome
    }

    /// Force-close everything immediately.
    pub fn stop(&self) {
        self.state.send_replace(DrainState::Stopped);
    }
}

/// Keeps the drain from completing while alive.
pub struct DrainGuard {
    coordinator: Arc<DrainCoordinator>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.coordinator
            .in_flight
            .send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Resolve once the coordinator leaves `Running`.
pub async fn draining(rx: &mut watch::Receiver<DrainState>) {
    let _ = rx.wait_for(|state| *state != DrainState::Running).await;
}

/// Resolve once the coordinator reaches `Stopped`.
pub async fn stopped(rx: &mut watch::Receiver<DrainState>) {
    // A dropped coordinator means the process is going away.
    let _ = rx.wait_for(|state| *state == DrainState::Stopped).await;
}
