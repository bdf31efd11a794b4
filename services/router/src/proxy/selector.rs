//! Endpoint selection within a route pool.
//!
//! - Sticky sessions: an affinity id naming a live, eligible instance wins
//! - Otherwise least in-flight requests, ties broken round-robin
//! - Endpoints with too many consecutive dial failures are skipped, unless
//!   every candidate is failing
//! - Endpoints already tried by this request are never picked again

use std::sync::Arc;

use tracing::debug;

use crate::registry::{Endpoint, EndpointKey, RoutePool};

/// Default consecutive dial failures before an endpoint is skipped.
pub const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Consecutive dial failures above which an endpoint is unhealthy.
    pub unhealthy_threshold: u32,
    /// In-flight cap per endpoint; 0 disables the cap.
    pub max_conns_per_endpoint: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            unhealthy_threshold: DEFAULT_UNHEALTHY_THRESHOLD,
            max_conns_per_endpoint: 0,
        }
    }
}

/// Outcome of a selection.
#[derive(Debug, Clone)]
pub enum Selection {
    Selected(Arc<Endpoint>),
    /// No endpoint left that this request has not already tried.
    Exhausted,
    /// Candidates exist but all are at their connection cap.
    AtCapacity,
}

#[derive(Debug, Clone, Default)]
pub struct EndpointSelector {
    config: SelectorConfig,
}

impl EndpointSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    pub async fn select(
        &self,
        pool: &RoutePool,
        affinity: Option<&str>,
        exclude: &[EndpointKey],
    ) -> Selection {
        let endpoints = pool.endpoints().await;
        let candidates: Vec<Arc<Endpoint>> = endpoints
            .into_iter()
            .filter(|e| !exclude.iter().any(|k| k.host == e.host && k.port == e.port))
            .collect();

        if candidates.is_empty() {
            return Selection::Exhausted;
        }

        let healthy: Vec<Arc<Endpoint>> = candidates
            .iter()
            .filter(|e| e.stats.consecutive_failures() <= self.config.unhealthy_threshold)
            .cloned()
            .collect();
        let eligible = if healthy.is_empty() {
            debug!(uri = %pool.uri(), "All endpoints failing; selecting among all");
            candidates
        } else {
            healthy
        };

        let under_cap: Vec<Arc<Endpoint>> = eligible
            .into_iter()
            .filter(|e| {
                self.config.max_conns_per_endpoint == 0
                    || e.stats.in_flight() < self.config.max_conns_per_endpoint
            })
            .collect();
        if under_cap.is_empty() {
            return Selection::AtCapacity;
        }

        if let Some(id) = affinity {
            if let Some(sticky) = under_cap
                .iter()
                .find(|e| e.private_instance_id.as_deref() == Some(id))
            {
                return Selection::Selected(Arc::clone(sticky));
            }
        }

        let count = under_cap.len();
        let start = pool.next_cursor() % count;
        let mut best = &under_cap[start];
        for offset in 1..count {
            let candidate = &under_cap[(start + offset) % count];
            if candidate.stats.in_flight() < best.stats.in_flight() {
                best = candidate;
            }
        }
        Selection::Selected(Arc::clone(best))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RouteUri;
    use std::collections::HashMap;
    use std::time::Instant;

    async fn pool_with(endpoints: Vec<Endpoint>) -> RoutePool {
        let pool = RoutePool::new(RouteUri::parse("demo.example.test").unwrap());
        for endpoint in endpoints {
            pool.upsert(endpoint, Instant::now()).await.unwrap();
        }
        pool
    }

    fn selected(selection: Selection) -> Arc<Endpoint> {
        match selection {
            Selection::Selected(e) => e,
            other => panic!("expected a selection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_round_robin_is_even_when_idle() {
        let pool = pool_with(vec![
            Endpoint::new("10.0.0.1", 1),
            Endpoint::new("10.0.0.2", 2),
            Endpoint::new("10.0.0.3", 3),
        ])
        .await;
        let selector = EndpointSelector::default();

        let mut counts: HashMap<u16, usize> = HashMap::new();
        for _ in 0..300 {
            let endpoint = selected(selector.select(&pool, None, &[]).await);
            *counts.entry(endpoint.port).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 100));
    }

    #[tokio::test]
    async fn test_prefers_fewest_in_flight() {
        let pool = pool_with(vec![Endpoint::new("10.0.0.1", 1), Endpoint::new("10.0.0.2", 2)]).await;
        let busy = pool.endpoints().await[0].clone();
        let _guards: Vec<_> = (0..5).map(|_| busy.stats.begin_request()).collect();
        let selector = EndpointSelector::default();

        for _ in 0..10 {
            assert_eq!(selected(selector.select(&pool, None, &[]).await).port, 2);
        }
    }

    #[tokio::test]
    async fn test_affinity_wins_when_eligible() {
        let pool = pool_with(vec![
            Endpoint::new("10.0.0.1", 1).with_private_instance_id("a"),
            Endpoint::new("10.0.0.2", 2).with_private_instance_id("b"),
        ])
        .await;
        let selector = EndpointSelector::default();

        for _ in 0..5 {
            assert_eq!(selected(selector.select(&pool, Some("b"), &[]).await).port, 2);
        }
        // Unknown id falls back to normal balancing.
        assert!(matches!(
            selector.select(&pool, Some("gone"), &[]).await,
            Selection::Selected(_)
        ));
    }

    #[tokio::test]
    async fn test_excluded_endpoints_are_skipped() {
        let pool = pool_with(vec![Endpoint::new("10.0.0.1", 1), Endpoint::new("10.0.0.2", 2)]).await;
        let selector = EndpointSelector::default();
        let tried = vec![Endpoint::new("10.0.0.1", 1).key()];

        assert_eq!(selected(selector.select(&pool, None, &tried).await).port, 2);

        let all = vec![Endpoint::new("10.0.0.1", 1).key(), Endpoint::new("10.0.0.2", 2).key()];
        assert!(matches!(
            selector.select(&pool, None, &all).await,
            Selection::Exhausted
        ));
    }

    #[tokio::test]
    async fn test_failing_endpoint_is_skipped_until_all_fail() {
        let pool = pool_with(vec![Endpoint::new("10.0.0.1", 1), Endpoint::new("10.0.0.2", 2)]).await;
        let endpoints = pool.endpoints().await;
        let selector = EndpointSelector::new(SelectorConfig {
            unhealthy_threshold: 1,
            max_conns_per_endpoint: 0,
        });

        endpoints[0].stats.record_dial_failure();
        endpoints[0].stats.record_dial_failure();
        for _ in 0..4 {
            assert_eq!(selected(selector.select(&pool, None, &[]).await).port, 2);
        }

        endpoints[1].stats.record_dial_failure();
        endpoints[1].stats.record_dial_failure();
        assert!(matches!(
            selector.select(&pool, None, &[]).await,
            Selection::Selected(_)
        ));
    }

    #[tokio::test]
    async fn test_connection_cap() {
        let pool = pool_with(vec![Endpoint::new("10.0.0.1", 1)]).await;
        let endpoint = pool.endpoints().await[0].clone();
        let selector = EndpointSelector::new(SelectorConfig {
            unhealthy_threshold: 3,
            max_conns_per_endpoint: 1,
        });

        let guard = endpoint.stats.begin_request();
        assert!(matches!(
            selector.select(&pool, None, &[]).await,
            Selection::AtCapacity
        ));
        drop(guard);
        assert!(matches!(
            selector.select(&pool, None, &[]).await,
            Selection::Selected(_)
        ));
    }

    #[tokio::test]
    async fn test_empty_pool_is_exhausted() {
        let pool = pool_with(vec![]).await;
        assert!(matches!(
            EndpointSelector::default().select(&pool, None, &[]).await,
            Selection::Exhausted
        ));
    }
}
