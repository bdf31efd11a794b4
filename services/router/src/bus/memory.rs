use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::trace;

use super::{BusMessage, BusStatus, DiscoveryError, MessageBus};

const SUBSCRIPTION_BUFFER: usize = 1024;

/// Message bus living inside the router process.
///
/// Delivery is best-effort: a subscriber whose buffer is full misses the
/// message, like a slow consumer on a real broker. While marked unavailable
/// the bus refuses publishes, which stops heartbeats from arriving.
pub struct InProcessBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<BusMessage>>>>,
    status: watch::Sender<BusStatus>,
}

impl InProcessBus {
    pub fn new() -> Self {
        let (status, _) = watch::channel(BusStatus::Connected);
        Self {
            subscribers: Mutex::new(HashMap::new()),
            status,
        }
    }

    /// Simulate the bus going away or coming back.
    pub fn set_status(&self, status: BusStatus) {
        self.status.send_replace(status);
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<BusMessage>, DiscoveryError> {
        if *self.status.borrow() == BusStatus::Unavailable {
            return Err(DiscoveryError::Subscribe {
                subject: subject.to_string(),
                reason: "bus unavailable".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.entry(subject.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn publish(&self, message: BusMessage) -> Result<(), DiscoveryError> {
        if *self.status.borrow() == BusStatus::Unavailable {
            return Err(DiscoveryError::Unavailable);
        }

        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(senders) = subscribers.get_mut(&message.subject) {
            senders.retain(|tx| !tx.is_closed());
            for tx in senders.iter() {
                if tx.try_send(message.clone()).is_err() {
                    trace!(subject = %message.subject, "Dropped message for slow subscriber");
                }
            }
        }
        Ok(())
    }

    fn status(&self) -> watch::Receiver<BusStatus> {
        self.status.subscribe()
    }
}
