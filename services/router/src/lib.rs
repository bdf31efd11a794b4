//! beacon router
//!
//! Heartbeat-routed HTTP reverse proxy. Backends announce themselves on a
//! message bus; the router keeps a live route table from those heartbeats
//! and proxies client requests to the registered instances.

pub mod admin;
pub mod bus;
pub mod clock;
pub mod config;
pub mod drain;
pub mod proxy;
pub mod registry;
pub mod route_service;
pub mod routing_api;
pub mod tls;

pub use bus::{BusStatus, InProcessBus, MessageBus};
pub use drain::{DrainCoordinator, DrainOutcome, DrainState};
pub use proxy::{Dispatcher, DispatcherConfig, Listener, ListenerConfig};
pub use registry::{Endpoint, RouteRegistry, RouteUri};
