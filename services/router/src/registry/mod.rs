//! Route registry.
//!
//! Maps route URIs to pools of live endpoints. Registrations arrive as
//! heartbeats; an endpoint stays routable until it is unregistered or its
//! heartbeat goes stale and a prune cycle evicts it.
//!
//! Locking: the URI map and each pool have their own lock. The map lock is
//! always taken before a pool lock, never the other way round. A pool that
//! becomes empty is retired under both locks so that a concurrent register
//! cannot insert into a pool that is no longer reachable.

pub mod endpoint;
pub mod pruner;
pub mod uri;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::clock::SharedClock;

pub use endpoint::{
    Endpoint, EndpointKey, EndpointStats, InFlightGuard, PoolEntry, RoutePool, UpsertOutcome,
};
pub use pruner::{PruneConfig, PruneTick, Pruner};
pub use uri::{normalize_host, RouteUri};

/// One evicted endpoint.
#[derive(Debug, Clone)]
pub struct PrunedEndpoint {
    pub uri: RouteUri,
    pub endpoint: Arc<Endpoint>,
}

/// Point-in-time view of one endpoint for the admin surface.
#[derive(Debug, Clone)]
pub struct EndpointSnapshot {
    pub endpoint: Arc<Endpoint>,
    /// Time left before the endpoint is considered stale.
    pub ttl: Duration,
}

/// Point-in-time view of one pool.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub uri: RouteUri,
    pub route_service_url: Option<String>,
    pub endpoints: Vec<EndpointSnapshot>,
}

/// Concurrent route table.
pub struct RouteRegistry {
    pools: RwLock<HashMap<RouteUri, Arc<RoutePool>>>,
    clock: SharedClock,
    stale_threshold: Duration,
}

impl RouteRegistry {
    pub fn new(clock: SharedClock, stale_threshold: Duration) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            clock,
            stale_threshold,
        }
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Add or refresh an endpoint under a URI.
    pub async fn register(&self, uri: RouteUri, endpoint: Endpoint) -> UpsertOutcome {
        loop {
            let pool = self.get_or_create_pool(&uri).await;
            match pool.upsert(endpoint.clone(), self.clock.now()).await {
                Ok(outcome) => {
                    if outcome == UpsertOutcome::Added {
                        debug!(uri = %uri, endpoint = %endpoint.address(), "Endpoint registered");
                    }
                    return outcome;
                }
                // Pool was removed between lookup and insert; retry against a
                // fresh one.
                Err(_) => continue,
            }
        }
    }

    /// Remove an endpoint from a URI. Unknown URIs and endpoints are ignored.
    ///
    /// Returns whether an endpoint was actually removed.
    pub async fn unregister(&self, uri: &RouteUri, key: &EndpointKey) -> bool {
        let Some(pool) = self.pools.read().await.get(uri).cloned() else {
            return false;
        };

        let removed = pool.remove(key).await;
        if removed {
            debug!(uri = %uri, endpoint = %key, "Endpoint unregistered");
            if pool.is_empty().await {
                self.remove_pool_if_empty(uri, &pool).await;
            }
        }
        removed
    }

    /// Find the pool serving a request for `host` and `path`.
    ///
    /// Tries the exact URI, then shorter path prefixes, then the wildcard
    /// host with the same prefix walk.
    pub async fn lookup(&self, host: &str, path: &str) -> Option<Arc<RoutePool>> {
        let pools = self.pools.read().await;
        RouteUri::lookup_candidates(host, path)
            .into_iter()
            .find_map(|candidate| pools.get(&candidate).cloned())
    }

    /// Find a pool by its exact key.
    pub async fn get(&self, uri: &RouteUri) -> Option<Arc<RoutePool>> {
        self.pools.read().await.get(uri).cloned()
    }

    /// Evict stale endpoints and drop emptied pools.
    ///
    /// Pools are visited one at a time; lookups and registrations on other
    /// pools proceed while a cycle runs.
    pub async fn prune_cycle(&self) -> Vec<PrunedEndpoint> {
        let pools: Vec<Arc<RoutePool>> = self.pools.read().await.values().cloned().collect();
        let now = self.clock.now();

        let mut pruned = Vec::new();
        for pool in pools {
            let evicted = pool.prune(now, self.stale_threshold).await;
            if evicted.is_empty() {
                continue;
            }

            for endpoint in evicted {
                info!(
                    uri = %pool.uri(),
                    endpoint = %endpoint.address(),
                    app_id = %endpoint.app_id,
                    "Pruned stale endpoint"
                );
                pruned.push(PrunedEndpoint {
                    uri: pool.uri().clone(),
                    endpoint,
                });
            }

            if pool.is_empty().await {
                self.remove_pool_if_empty(pool.uri(), &pool).await;
            }
        }
        pruned
    }

    /// Reset every heartbeat to now.
    ///
    /// Used when pruning resumes after a bus outage, so endpoints that could
    /// not heartbeat during the outage get a full threshold to report in.
    pub async fn freshen_all(&self) {
        let pools: Vec<Arc<RoutePool>> = self.pools.read().await.values().cloned().collect();
        let now = self.clock.now();
        for pool in pools {
            pool.freshen(now).await;
        }
    }

    /// Copy of the whole table, sorted by URI.
    pub async fn snapshot(&self) -> Vec<PoolSnapshot> {
        let pools: Vec<Arc<RoutePool>> = self.pools.read().await.values().cloned().collect();
        let now = self.clock.now();

        let mut snapshot = Vec::with_capacity(pools.len());
        for pool in pools {
            let entries = pool.entries().await;
            if entries.is_empty() {
                continue;
            }
            let endpoints = entries
                .into_iter()
                .map(|entry| {
                    let threshold = entry
                        .endpoint
                        .effective_stale_threshold(self.stale_threshold);
                    let age = now.saturating_duration_since(entry.last_heartbeat);
                    EndpointSnapshot {
                        endpoint: entry.endpoint,
                        ttl: threshold.saturating_sub(age),
                    }
                })
                .collect();
            snapshot.push(PoolSnapshot {
                uri: pool.uri().clone(),
                route_service_url: pool.route_service_url().await,
                endpoints,
            });
        }
        snapshot.sort_by(|a, b| a.uri.cmp(&b.uri));
        snapshot
    }

    /// Number of URIs with a pool.
    pub async fn len(&self) -> usize {
        self.pools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pools.read().await.is_empty()
    }

    /// Total endpoint registrations across all pools.
    pub async fn endpoint_count(&self) -> usize {
        let pools: Vec<Arc<RoutePool>> = self.pools.read().await.values().cloned().collect();
        let mut total = 0;
        for pool in pools {
            total += pool.len().await;
        }
        total
    }

    async fn get_or_create_pool(&self, uri: &RouteUri) -> Arc<RoutePool> {
        // Fast path: read lock
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(uri) {
                return Arc::clone(pool);
            }
        }

        // Slow path: write lock
        let mut pools = self.pools.write().await;
        // Double-check after acquiring write lock
        if let Some(pool) = pools.get(uri) {
            return Arc::clone(pool);
        }

        let pool = Arc::new(RoutePool::new(uri.clone()));
        pools.insert(uri.clone(), Arc::clone(&pool));
        pool
    }

    async fn remove_pool_if_empty(&self, uri: &RouteUri, pool: &Arc<RoutePool>) {
        let mut pools = self.pools.write().await;
        let current = match pools.get(uri) {
            Some(current) if Arc::ptr_eq(current, pool) => current,
            _ => return,
        };
        if current.retire_if_empty().await {
            pools.remove(uri);
            debug!(uri = %uri, "Removed empty route pool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const THRESHOLD: Duration = Duration::from_secs(120);

    fn registry() -> (Arc<ManualClock>, RouteRegistry) {
        let clock = Arc::new(ManualClock::new());
        let registry = RouteRegistry::new(clock.clone(), THRESHOLD);
        (clock, registry)
    }

    fn uri(raw: &str) -> RouteUri {
        RouteUri::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_register_then_lookup() {
        let (_, registry) = registry();
        registry
            .register(uri("demo.example.test"), Endpoint::new("127.0.0.1", 5000))
            .await;

        let pool = registry.lookup("demo.example.test", "/").await.unwrap();
        let endpoints = pool.endpoints().await;
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].address(), "127.0.0.1:5000");
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (_, registry) = registry();
        let first = registry
            .register(uri("demo.example.test"), Endpoint::new("127.0.0.1", 5000))
            .await;
        let second = registry
            .register(uri("demo.example.test"), Endpoint::new("127.0.0.1", 5000))
            .await;

        assert_eq!(first, UpsertOutcome::Added);
        assert_eq!(second, UpsertOutcome::Refreshed);
        assert_eq!(registry.endpoint_count().await, 1);
    }

    #[tokio::test]
    async fn test_unregister_removes_pool_when_last_endpoint_leaves() {
        let (_, registry) = registry();
        let key = Endpoint::new("127.0.0.1", 5000).key();
        registry
            .register(uri("demo.example.test"), Endpoint::new("127.0.0.1", 5000))
            .await;

        assert!(registry.unregister(&uri("demo.example.test"), &key).await);
        assert!(registry.lookup("demo.example.test", "/").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_noop() {
        let (_, registry) = registry();
        let key = Endpoint::new("127.0.0.1", 5000).key();
        assert!(!registry.unregister(&uri("nothing.example.test"), &key).await);

        registry
            .register(uri("demo.example.test"), Endpoint::new("127.0.0.1", 6000))
            .await;
        assert!(!registry.unregister(&uri("demo.example.test"), &key).await);
        assert_eq!(registry.endpoint_count().await, 1);
    }

    #[tokio::test]
    async fn test_lookup_prefers_longest_path() {
        let (_, registry) = registry();
        registry
            .register(uri("demo.example.test"), Endpoint::new("10.0.0.1", 1))
            .await;
        registry
            .register(uri("demo.example.test/api"), Endpoint::new("10.0.0.2", 2))
            .await;

        let api = registry.lookup("demo.example.test", "/api/users").await.unwrap();
        assert_eq!(api.uri().as_str(), "demo.example.test/api");

        let root = registry.lookup("demo.example.test", "/other").await.unwrap();
        assert_eq!(root.uri().as_str(), "demo.example.test");
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_wildcard() {
        let (_, registry) = registry();
        registry
            .register(uri("*.apps.example.test"), Endpoint::new("10.0.0.1", 1))
            .await;
        registry
            .register(uri("named.apps.example.test"), Endpoint::new("10.0.0.2", 2))
            .await;

        let named = registry.lookup("named.apps.example.test", "/").await.unwrap();
        assert_eq!(named.uri().as_str(), "named.apps.example.test");

        let other = registry.lookup("other.apps.example.test", "/").await.unwrap();
        assert_eq!(other.uri().as_str(), "*.apps.example.test");

        assert!(registry.lookup("apps.example.test", "/").await.is_none());
    }

    #[tokio::test]
    async fn test_prune_evicts_only_stale() {
        let (clock, registry) = registry();
        registry
            .register(uri("old.example.test"), Endpoint::new("10.0.0.1", 1))
            .await;
        clock.advance(Duration::from_secs(100));
        registry
            .register(uri("fresh.example.test"), Endpoint::new("10.0.0.2", 2))
            .await;
        clock.advance(Duration::from_secs(21));

        let pruned = registry.prune_cycle().await;
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].uri.as_str(), "old.example.test");
        assert!(registry.lookup("old.example.test", "/").await.is_none());
        assert!(registry.lookup("fresh.example.test", "/").await.is_some());
    }

    #[tokio::test]
    async fn test_prune_exactly_at_threshold_keeps_endpoint() {
        let (clock, registry) = registry();
        registry
            .register(uri("demo.example.test"), Endpoint::new("10.0.0.1", 1))
            .await;
        clock.advance(THRESHOLD);

        assert!(registry.prune_cycle().await.is_empty());
    }

    #[tokio::test]
    async fn test_prune_honors_longer_override() {
        let (clock, registry) = registry();
        registry
            .register(
                uri("demo.example.test"),
                Endpoint::new("10.0.0.1", 1).with_stale_threshold(Duration::from_secs(300)),
            )
            .await;
        clock.advance(Duration::from_secs(200));

        assert!(registry.prune_cycle().await.is_empty());

        clock.advance(Duration::from_secs(101));
        assert_eq!(registry.prune_cycle().await.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_resets_staleness() {
        let (clock, registry) = registry();
        let endpoint = Endpoint::new("10.0.0.1", 1);
        registry.register(uri("demo.example.test"), endpoint.clone()).await;
        clock.advance(Duration::from_secs(100));
        registry.register(uri("demo.example.test"), endpoint).await;
        clock.advance(Duration::from_secs(100));

        assert!(registry.prune_cycle().await.is_empty());
    }

    #[tokio::test]
    async fn test_freshen_all_resets_heartbeats() {
        let (clock, registry) = registry();
        registry
            .register(uri("demo.example.test"), Endpoint::new("10.0.0.1", 1))
            .await;
        clock.advance(Duration::from_secs(500));
        registry.freshen_all().await;
        clock.advance(Duration::from_secs(60));

        assert!(registry.prune_cycle().await.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_reports_ttl() {
        let (clock, registry) = registry();
        registry
            .register(uri("b.example.test"), Endpoint::new("10.0.0.2", 2))
            .await;
        registry
            .register(
                uri("a.example.test"),
                Endpoint::new("10.0.0.1", 1).with_route_service_url("https://rs.example.test"),
            )
            .await;
        clock.advance(Duration::from_secs(20));

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].uri.as_str(), "a.example.test");
        assert_eq!(
            snapshot[0].route_service_url.as_deref(),
            Some("https://rs.example.test")
        );
        assert_eq!(snapshot[0].endpoints[0].ttl, Duration::from_secs(100));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_unregister_lookup() {
        let (_, registry) = registry();
        let registry = Arc::new(registry);
        let route = uri("busy.example.test");

        let mut tasks = Vec::new();
        for worker in 0..8u16 {
            let registry = Arc::clone(&registry);
            let route = route.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..200u16 {
                    let endpoint = Endpoint::new("10.0.0.1", worker * 1000 + i);
                    let key = endpoint.key();
                    registry.register(route.clone(), endpoint).await;
                    let _ = registry.lookup("busy.example.test", "/").await;
                    if i % 2 == 0 {
                        registry.unregister(&route, &key).await;
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Every odd registration survives and nothing was lost to a retired pool.
        assert_eq!(registry.endpoint_count().await, 8 * 100);
        let pool = registry.lookup("busy.example.test", "/").await.unwrap();
        assert_eq!(pool.len().await, 800);
    }
}
