//! Endpoint and route pool model.
//!
//! A [`RoutePool`] owns its endpoints; endpoints carry no reference back to
//! the pool. Live request counters sit behind an `Arc` so the dispatcher can
//! update them without touching pool locks, and so they survive
//! re-registration of the same (host, port).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

use super::uri::RouteUri;

/// Identity of an endpoint within a pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Live counters for one backend instance.
#[derive(Debug, Default)]
pub struct EndpointStats {
    in_flight: AtomicUsize,
    succeeded: AtomicU64,
    failed: AtomicU64,
    consecutive_failures: AtomicU32,
    last_latency_ms: AtomicU64,
}

impl EndpointStats {
    /// Count a request as in flight until the returned guard drops.
    pub fn begin_request(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn last_latency(&self) -> Duration {
        Duration::from_millis(self.last_latency_ms.load(Ordering::Relaxed))
    }

    /// A connection to the endpoint was established.
    pub fn record_dial_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// A connection attempt failed. Returns the new consecutive count.
    pub fn record_dial_failure(&self) -> u32 {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The endpoint produced a response.
    pub fn record_success(&self, latency: Duration) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// The request failed after a connection was made.
    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Decrements the in-flight counter on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    stats: Arc<EndpointStats>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A backend application instance.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub app_id: String,
    pub private_instance_id: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub isolation_segment: Option<String>,
    /// Name to verify in the backend certificate when `tls` is set.
    pub server_cert_domain_san: Option<String>,
    pub tls: bool,
    /// Per-endpoint stale threshold override.
    pub stale_threshold: Option<Duration>,
    pub route_service_url: Option<String>,
    /// Publisher wall-clock timestamp of the last heartbeat.
    pub updated_at_ns: i64,
    pub stats: Arc<EndpointStats>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            app_id: String::new(),
            private_instance_id: None,
            tags: BTreeMap::new(),
            isolation_segment: None,
            server_cert_domain_san: None,
            tls: false,
            stale_threshold: None,
            route_service_url: None,
            updated_at_ns: 0,
            stats: Arc::new(EndpointStats::default()),
        }
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    pub fn with_private_instance_id(mut self, id: impl Into<String>) -> Self {
        self.private_instance_id = Some(id.into());
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = Some(threshold);
        self
    }

    pub fn with_route_service_url(mut self, url: impl Into<String>) -> Self {
        self.route_service_url = Some(url.into());
        self
    }

    pub fn with_tls(mut self, server_cert_domain_san: Option<String>) -> Self {
        self.tls = true;
        self.server_cert_domain_san = server_cert_domain_san;
        self
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn address(&self) -> String {
        self.key().to_string()
    }

    /// Effective threshold: the larger of the global value and the override.
    pub fn effective_stale_threshold(&self, global: Duration) -> Duration {
        match self.stale_threshold {
            Some(t) => t.max(global),
            None => global,
        }
    }

    fn same_identity(&self, other: &Endpoint) -> bool {
        self.host == other.host && self.port == other.port
    }
}

/// An endpoint slot inside a pool.
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub endpoint: Arc<Endpoint>,
    pub last_heartbeat: Instant,
}

/// Result of inserting into a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    Refreshed,
}

/// The pool was removed from the registry while the caller held it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRetired;

#[derive(Debug, Default)]
struct PoolInner {
    entries: Vec<PoolEntry>,
    route_service_url: Option<String>,
    isolation_segment: Option<String>,
    retired: bool,
}

/// The set of endpoints bound to one route URI.
#[derive(Debug)]
pub struct RoutePool {
    uri: RouteUri,
    inner: RwLock<PoolInner>,
    cursor: AtomicUsize,
}

impl RoutePool {
    pub fn new(uri: RouteUri) -> Self {
        Self {
            uri,
            inner: RwLock::new(PoolInner::default()),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn uri(&self) -> &RouteUri {
        &self.uri
    }

    /// Insert a new endpoint or refresh an existing one.
    ///
    /// A refresh replaces the endpoint metadata and heartbeat but keeps the
    /// live counters of the previous registration.
    pub async fn upsert(
        &self,
        mut endpoint: Endpoint,
        now: Instant,
    ) -> Result<UpsertOutcome, PoolRetired> {
        let mut inner = self.inner.write().await;
        if inner.retired {
            return Err(PoolRetired);
        }

        inner.route_service_url = endpoint.route_service_url.clone();
        if endpoint.isolation_segment.is_some() {
            inner.isolation_segment = endpoint.isolation_segment.clone();
        }

        if let Some(entry) = inner
            .entries
            .iter_mut()
            .find(|e| e.endpoint.same_identity(&endpoint))
        {
            endpoint.stats = Arc::clone(&entry.endpoint.stats);
            entry.endpoint = Arc::new(endpoint);
            entry.last_heartbeat = now;
            return Ok(UpsertOutcome::Refreshed);
        }

        inner.entries.push(PoolEntry {
            endpoint: Arc::new(endpoint),
            last_heartbeat: now,
        });
        Ok(UpsertOutcome::Added)
    }

    /// Remove an endpoint by identity. Returns whether it was present.
    pub async fn remove(&self, key: &EndpointKey) -> bool {
        let mut inner = self.inner.write().await;
        let before = inner.entries.len();
        inner
            .entries
            .retain(|e| !(e.endpoint.host == key.host && e.endpoint.port == key.port));
        inner.entries.len() != before
    }

    /// Evict endpoints whose heartbeat is older than their effective threshold.
    pub async fn prune(&self, now: Instant, global_threshold: Duration) -> Vec<Arc<Endpoint>> {
        let mut inner = self.inner.write().await;
        let mut pruned = Vec::new();
        inner.entries.retain(|entry| {
            let threshold = entry.endpoint.effective_stale_threshold(global_threshold);
            let stale = now.saturating_duration_since(entry.last_heartbeat) > threshold;
            if stale {
                pruned.push(Arc::clone(&entry.endpoint));
            }
            !stale
        });
        pruned
    }

    /// Treat every endpoint as having just sent a heartbeat.
    pub async fn freshen(&self, now: Instant) {
        let mut inner = self.inner.write().await;
        for entry in inner.entries.iter_mut() {
            entry.last_heartbeat = now;
        }
    }

    /// Mark the pool retired if it has no endpoints left.
    ///
    /// A retired pool refuses further inserts so a registration racing with
    /// removal retries against a fresh pool instead of being lost.
    pub(crate) async fn retire_if_empty(&self) -> bool {
        let mut inner = self.inner.write().await;
        if inner.entries.is_empty() {
            inner.retired = true;
            debug!(uri = %self.uri, "Route pool retired");
            true
        } else {
            false
        }
    }

    pub async fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.inner
            .read()
            .await
            .entries
            .iter()
            .map(|e| Arc::clone(&e.endpoint))
            .collect()
    }

    pub async fn entries(&self) -> Vec<PoolEntry> {
        self.inner.read().await.entries.clone()
    }

    pub async fn find(&self, key: &EndpointKey) -> Option<Arc<Endpoint>> {
        self.inner
            .read()
            .await
            .entries
            .iter()
            .find(|e| e.endpoint.host == key.host && e.endpoint.port == key.port)
            .map(|e| Arc::clone(&e.endpoint))
    }

    pub async fn route_service_url(&self) -> Option<String> {
        self.inner.read().await.route_service_url.clone()
    }

    pub async fn isolation_segment(&self) -> Option<String> {
        self.inner.read().await.isolation_segment.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    /// Advance the round-robin cursor and return its previous position.
    pub fn next_cursor(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> RoutePool {
        RoutePool::new(RouteUri::parse("demo.example.test").unwrap())
    }

    #[test]
    fn test_endpoint_address_formats_ipv6() {
        assert_eq!(Endpoint::new("10.0.0.1", 80).address(), "10.0.0.1:80");
        assert_eq!(Endpoint::new("fd00::1", 80).address(), "[fd00::1]:80");
    }

    #[test]
    fn test_effective_stale_threshold_takes_larger() {
        let global = Duration::from_secs(120);
        let plain = Endpoint::new("10.0.0.1", 80);
        let short = Endpoint::new("10.0.0.1", 80).with_stale_threshold(Duration::from_secs(30));
        let long = Endpoint::new("10.0.0.1", 80).with_stale_threshold(Duration::from_secs(300));

        assert_eq!(plain.effective_stale_threshold(global), global);
        assert_eq!(short.effective_stale_threshold(global), global);
        assert_eq!(long.effective_stale_threshold(global), Duration::from_secs(300));
    }

    #[test]
    fn test_in_flight_guard_decrements() {
        let stats = Arc::new(EndpointStats::default());
        let a = stats.begin_request();
        let b = stats.begin_request();
        assert_eq!(stats.in_flight(), 2);
        drop(a);
        assert_eq!(stats.in_flight(), 1);
        drop(b);
        assert_eq!(stats.in_flight(), 0);
    }

    #[test]
    fn test_dial_failures_reset_on_success() {
        let stats = EndpointStats::default();
        assert_eq!(stats.record_dial_failure(), 1);
        assert_eq!(stats.record_dial_failure(), 2);
        stats.record_success(Duration::from_millis(12));
        assert_eq!(stats.consecutive_failures(), 0);
        assert_eq!(stats.failed(), 2);
        assert_eq!(stats.succeeded(), 1);
        assert_eq!(stats.last_latency(), Duration::from_millis(12));
    }

    #[tokio::test]
    async fn test_upsert_refresh_keeps_stats() {
        let pool = pool();
        let now = Instant::now();

        let first = Endpoint::new("10.0.0.1", 8080).with_app_id("app-1");
        assert_eq!(pool.upsert(first, now).await, Ok(UpsertOutcome::Added));

        let existing = pool.endpoints().await.remove(0);
        existing.stats.record_success(Duration::from_millis(5));

        let again = Endpoint::new("10.0.0.1", 8080).with_app_id("app-2");
        assert_eq!(
            pool.upsert(again, now + Duration::from_secs(1)).await,
            Ok(UpsertOutcome::Refreshed)
        );

        let endpoints = pool.endpoints().await;
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].app_id, "app-2");
        assert_eq!(endpoints[0].stats.succeeded(), 1);
    }

    #[tokio::test]
    async fn test_prune_uses_heartbeat_age() {
        let pool = pool();
        let start = Instant::now();
        pool.upsert(Endpoint::new("10.0.0.1", 1), start).await.unwrap();
        pool.upsert(Endpoint::new("10.0.0.2", 2), start + Duration::from_secs(20))
            .await
            .unwrap();

        let pruned = pool
            .prune(start + Duration::from_secs(31), Duration::from_secs(30))
            .await;
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].host, "10.0.0.1");
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_retired_pool_rejects_upsert() {
        let pool = pool();
        assert!(pool.retire_if_empty().await);
        assert_eq!(
            pool.upsert(Endpoint::new("10.0.0.1", 1), Instant::now()).await,
            Err(PoolRetired)
        );
    }

    #[tokio::test]
    async fn test_retire_refused_when_populated() {
        let pool = pool();
        pool.upsert(Endpoint::new("10.0.0.1", 1), Instant::now())
            .await
            .unwrap();
        assert!(!pool.retire_if_empty().await);
    }
}
