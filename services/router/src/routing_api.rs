//! Routing API client.
//!
//! Router groups describe which TCP port ranges this router may serve. The
//! list is fetched once at startup (a failure there is fatal) and then
//! refreshed on an interval; refresh failures keep the last good value.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Per-request timeout for routing API calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RoutingApiError {
    /// Transport failure or unreadable body.
    #[error("routing API request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Non-success status.
    #[error("routing API returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("invalid routing API token")]
    InvalidToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterGroup {
    pub guid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub reservable_ports: String,
}

/// Anything that can produce the current router groups.
#[async_trait]
pub trait RouterGroupSource: Send + Sync + 'static {
    async fn fetch(&self) -> Result<Vec<RouterGroup>, RoutingApiError>;
}

pub struct RoutingApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl RoutingApiClient {
    pub fn new(
        base_url: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, RoutingApiError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let raw = token.trim();
            let bearer = if raw.starts_with("Bearer ") || raw.starts_with("bearer ") {
                raw.to_string()
            } else {
                format!("Bearer {raw}")
            };
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&bearer).map_err(|_| RoutingApiError::InvalidToken)?,
            );
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("beacon-router/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RouterGroupSource for RoutingApiClient {
    async fn fetch(&self) -> Result<Vec<RouterGroup>, RoutingApiError> {
        let url = format!("{}/routing/v1/router_groups", self.base_url);
        let resp = self.client.get(url).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RoutingApiError::Status { status, body });
        }

        Ok(resp.json::<Vec<RouterGroup>>().await?)
    }
}

/// Last known router groups, readable without locking.
pub struct RouterGroups {
    source: Arc<dyn RouterGroupSource>,
    current: ArcSwap<Vec<RouterGroup>>,
    poll_interval: Duration,
}

impl RouterGroups {
    /// Fetch the initial list. Fails if the source is unreachable.
    pub async fn bootstrap(
        source: Arc<dyn RouterGroupSource>,
        poll_interval: Duration,
    ) -> Result<Arc<Self>, RoutingApiError> {
        let groups = source.fetch().await?;
        info!(router_groups = groups.len(), "Router groups loaded");
        Ok(Arc::new(Self {
            source,
            current: ArcSwap::from_pointee(groups),
            poll_interval,
        }))
    }

    #[cfg(test)]
    pub fn current(&self) -> Arc<Vec<RouterGroup>> {
        self.current.load_full()
    }

    /// Fetch once; keeps the previous list on failure.
    pub async fn refresh(&self) -> Result<(), RoutingApiError> {
        let groups = self.source.fetch().await?;
        if *self.current.load_full() != groups {
            info!(router_groups = groups.len(), "Router groups changed");
        }
        self.current.store(Arc::new(groups));
        Ok(())
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.refresh().await {
                        Ok(()) => debug!("Router groups refreshed"),
                        Err(e) => warn!(error = %e, "Failed to refresh router groups; keeping last known"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Router group poller shutting down");
                        break;
                    }
                }
            }
        }
    }
}
