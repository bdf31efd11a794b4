//! Applies registration traffic from the bus to the route registry.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use beacon_events::{subjects, RegistryMessage, RouterGreeting, ShardingMode};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::{BusMessage, DiscoveryError, MessageBus};
use crate::registry::{Endpoint, RouteRegistry, RouteUri};

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Use `tls_port` from registrations and speak TLS to those backends.
    pub backend_tls_enabled: bool,
    pub sharding_mode: ShardingMode,
    pub isolation_segments: Vec<String>,
    /// Identity announced on start and in greet replies.
    pub greeting: RouterGreeting,
}

pub struct RegistrySubscriber {
    bus: Arc<dyn MessageBus>,
    registry: Arc<RouteRegistry>,
    config: SubscriberConfig,
}

struct Subscriptions {
    register: mpsc::Receiver<BusMessage>,
    unregister: mpsc::Receiver<BusMessage>,
    greet: mpsc::Receiver<BusMessage>,
}

impl RegistrySubscriber {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<RouteRegistry>,
        config: SubscriberConfig,
    ) -> Self {
        Self {
            bus,
            registry,
            config,
        }
    }

    /// Subscribe, announce the router and spawn the message loop.
    ///
    /// Subscriptions are in place when this returns, so messages published
    /// afterwards are guaranteed to be seen.
    pub async fn spawn(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, DiscoveryError> {
        let subscriptions = Subscriptions {
            register: self.bus.subscribe(subjects::REGISTER).await?,
            unregister: self.bus.subscribe(subjects::UNREGISTER).await?,
            greet: self.bus.subscribe(subjects::GREET).await?,
        };

        let payload = self.config.greeting.to_vec()?;
        if let Err(e) = self
            .bus
            .publish(BusMessage::new(subjects::START, payload))
            .await
        {
            warn!(error = %e, "Failed to announce router start");
        }

        Ok(tokio::spawn(self.run(subscriptions, shutdown)))
    }

    #[instrument(skip_all)]
    async fn run(self, mut subs: Subscriptions, mut shutdown: watch::Receiver<bool>) {
        info!(
            sharding_mode = %self.config.sharding_mode,
            isolation_segments = ?self.config.isolation_segments,
            "Registry subscriber started"
        );

        loop {
            tokio::select! {
                Some(msg) = subs.register.recv() => self.handle_register(&msg).await,
                Some(msg) = subs.unregister.recv() => self.handle_unregister(&msg).await,
                Some(msg) = subs.greet.recv() => self.handle_greet(&msg).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Registry subscriber shutting down");
                        break;
                    }
                }
                else => {
                    warn!("All bus subscriptions closed");
                    break;
                }
            }
        }
    }

    async fn handle_register(&self, msg: &BusMessage) {
        let Some(registration) = self.decode(msg) else {
            return;
        };
        if !self.accepts(&registration) {
            return;
        }
        let Some(endpoint) = endpoint_from_message(&registration, self.config.backend_tls_enabled)
        else {
            debug!(host = %registration.host, "Registration has no usable port; ignoring");
            return;
        };

        if registration.updated_at_ns > 0 {
            let latency_ms = (now_unix_ns() - registration.updated_at_ns) / 1_000_000;
            debug!(endpoint = %endpoint.address(), latency_ms, "Registration received");
        }

        for raw in &registration.uris {
            match RouteUri::parse(raw) {
                Some(uri) => {
                    self.registry.register(uri, endpoint.clone()).await;
                }
                None => debug!(uri = %raw, "Skipping unparseable route URI"),
            }
        }
    }

    async fn handle_unregister(&self, msg: &BusMessage) {
        let Some(registration) = self.decode(msg) else {
            return;
        };
        if !self.accepts(&registration) {
            return;
        }
        let Some(endpoint) = endpoint_from_message(&registration, self.config.backend_tls_enabled)
        else {
            return;
        };

        let key = endpoint.key();
        for raw in &registration.uris {
            if let Some(uri) = RouteUri::parse(raw) {
                self.registry.unregister(&uri, &key).await;
            }
        }
    }

    async fn handle_greet(&self, msg: &BusMessage) {
        let Some(reply) = &msg.reply else {
            debug!("Greet without reply subject; ignoring");
            return;
        };
        let payload = match self.config.greeting.to_vec() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode greeting");
                return;
            }
        };
        if let Err(e) = self.bus.publish(BusMessage::new(reply.clone(), payload)).await {
            warn!(error = %e, "Failed to answer greet");
        }
    }

    fn decode(&self, msg: &BusMessage) -> Option<RegistryMessage> {
        match RegistryMessage::from_slice(&msg.payload) {
            Ok(registration) => Some(registration),
            Err(e) => {
                warn!(subject = %msg.subject, error = %e, "Discarding malformed registry message");
                None
            }
        }
    }

    fn accepts(&self, registration: &RegistryMessage) -> bool {
        let accepted = self.config.sharding_mode.accepts(
            registration.isolation_segment(),
            &self.config.isolation_segments,
        );
        if !accepted {
            debug!(
                host = %registration.host,
                isolation_segment = ?registration.isolation_segment(),
                "Registration outside this router's shard"
            );
        }
        accepted
    }
}

/// Build an endpoint from a registration.
///
/// With backend TLS enabled a `tls_port` wins over the plain port. Returns
/// `None` when the message only offers a port the router cannot use.
pub fn endpoint_from_message(msg: &RegistryMessage, backend_tls_enabled: bool) -> Option<Endpoint> {
    let (port, tls) = match msg.tls_port.filter(|p| *p != 0) {
        Some(tls_port) if backend_tls_enabled => (tls_port, true),
        _ if msg.port != 0 => (msg.port, false),
        _ => return None,
    };

    let mut endpoint = Endpoint::new(msg.host.trim(), port).with_app_id(msg.app.clone());
    endpoint.tags = msg.tags.clone();
    endpoint.private_instance_id = msg.private_instance_id().map(str::to_string);
    endpoint.isolation_segment = msg.isolation_segment().map(str::to_string);
    endpoint.stale_threshold = msg.stale_threshold();
    endpoint.route_service_url = msg.route_service_url().map(str::to_string);
    endpoint.updated_at_ns = msg.updated_at_ns;
    if tls {
        endpoint = endpoint.with_tls(msg.server_cert_domain_san().map(str::to_string));
    }
    Some(endpoint)
}

fn now_unix_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
