//! Message bus abstraction.
//!
//! The router only needs publish/subscribe on a handful of subjects plus a
//! view of whether the bus is reachable. [`MessageBus`] captures that; the
//! in-process implementation backs the binary's embedded mode and the tests.

mod memory;
pub mod subscriber;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub use memory::InProcessBus;
pub use subscriber::{RegistrySubscriber, SubscriberConfig};

/// A message delivered on a subject.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    /// Subject to answer on, for request/reply exchanges.
    pub reply: Option<String>,
    pub payload: Bytes,
}

impl BusMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            payload: payload.into(),
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }
}

/// Reachability of the message bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    Connected,
    Unavailable,
}

/// Errors from the discovery channel.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The bus cannot be reached.
    #[error("message bus unavailable")]
    Unavailable,

    /// Subscribing to a subject failed.
    #[error("failed to subscribe to {subject}: {reason}")]
    Subscribe { subject: String, reason: String },

    /// Publishing a message failed.
    #[error("failed to publish to {subject}: {reason}")]
    Publish { subject: String, reason: String },

    /// Encoding an outgoing message failed.
    #[error(transparent)]
    Encode(#[from] beacon_events::EventError),
}

#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Receive every message published on `subject` from now on.
    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<BusMessage>, DiscoveryError>;

    async fn publish(&self, message: BusMessage) -> Result<(), DiscoveryError>;

    /// Current and future reachability.
    fn status(&self) -> watch::Receiver<BusStatus>;
}
