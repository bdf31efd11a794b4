//! HTTP reverse proxy.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Dispatcher -> Registry lookup -> Selector -> Backend
//!                           |                                         |
//!                     route service                        pooled conn | tunnel
//! ```

mod backend;
mod dispatch;
mod error;
mod listener;
mod request;
mod selector;
mod tunnel;

pub use backend::{
    BackendConnector, BackendTarget, ConnectionPool, PoolConfig, PooledBody, ProxyBody,
    DEFAULT_CONNECT_TIMEOUT,
};
pub use dispatch::{
    status_response, ConnectionContext, Dispatcher, DispatcherConfig, DEFAULT_AFFINITY_COOKIE,
    DEFAULT_HEALTH_CHECK_USER_AGENT, DEFAULT_MAX_ATTEMPTS, DEFAULT_RESPONSE_TIMEOUT,
};
pub use error::{DialError, DispatchError};
pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use request::{RequestKind, Scheme, UpgradeProtocol};
pub use selector::{EndpointSelector, Selection, SelectorConfig, DEFAULT_UNHEALTHY_THRESHOLD};
pub use tunnel::{splice, TunnelStats};
