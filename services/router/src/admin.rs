//! Status server.
//!
//! `GET /routes` dumps the routing table (basic auth); `GET /healthz` is an
//! unauthenticated liveness probe that turns 503 once a drain starts.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::drain::{self, DrainCoordinator};
use crate::registry::RouteRegistry;

/// Username and password protecting `/routes`.
#[derive(Clone)]
pub struct BasicCredentials {
    pub user: String,
    pub pass: String,
}

impl std::fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .finish()
    }
}

#[derive(Clone)]
pub struct AdminState {
    registry: Arc<RouteRegistry>,
    drain: Arc<DrainCoordinator>,
    credentials: Arc<BasicCredentials>,
}

impl AdminState {
    pub fn new(
        registry: Arc<RouteRegistry>,
        drain: Arc<DrainCoordinator>,
        credentials: BasicCredentials,
    ) -> Self {
        Self {
            registry,
            drain,
            credentials: Arc::new(credentials),
        }
    }
}

/// One endpoint in the `/routes` listing.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct RouteEntry {
    pub address: String,
    pub tls: bool,
    /// Seconds until the endpoint goes stale.
    pub ttl: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_service_url: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub private_instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_cert_domain_san: Option<String>,
}

pub fn create_router(state: AdminState) -> Router {
    let protected = Router::new()
        .route("/routes", get(list_routes))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_basic_auth,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the status API until the drain reaches `Stopped`.
pub async fn serve(listener: TcpListener, state: AdminState) -> std::io::Result<()> {
    let local_addr: SocketAddr = listener.local_addr()?;
    let mut drain_state = state.drain.subscribe();
    info!(bind_addr = %local_addr, "Status server started");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { drain::stopped(&mut drain_state).await })
        .await
}

async fn healthz(State(state): State<AdminState>) -> impl IntoResponse {
    if state.drain.is_running() {
        (StatusCode::OK, "ok\n")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "draining\n")
    }
}

async fn list_routes(
    State(state): State<AdminState>,
) -> Json<BTreeMap<String, Vec<RouteEntry>>> {
    let snapshot = state.registry.snapshot().await;
    let routes = snapshot
        .into_iter()
        .map(|pool| {
            let entries = pool
                .endpoints
                .into_iter()
                .map(|snap| {
                    let endpoint = snap.endpoint;
                    RouteEntry {
                        address: endpoint.address(),
                        tls: endpoint.tls,
                        ttl: snap.ttl.as_secs(),
                        route_service_url: pool.route_service_url.clone(),
                        tags: endpoint.tags.clone(),
                        private_instance_id: endpoint
                            .private_instance_id
                            .clone()
                            .unwrap_or_default(),
                        server_cert_domain_san: endpoint.server_cert_domain_san.clone(),
                    }
                })
                .collect();
            (pool.uri.to_string(), entries)
        })
        .collect();
    Json(routes)
}

async fn require_basic_auth(
    State(state): State<AdminState>,
    request: Request,
    next: Next,
) -> Response {
    if authorized(request.headers(), &state.credentials) {
        return next.run(request).await;
    }

    let mut response = (StatusCode::UNAUTHORIZED, "401 Unauthorized\n").into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"beacon-router\""),
    );
    response
}

fn authorized(headers: &HeaderMap, credentials: &BasicCredentials) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.trim().strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    match decoded.split_once(':') {
        Some((user, pass)) => {
            let user_ok = constant_time_eq(user, &credentials.user);
            let pass_ok = constant_time_eq(pass, &credentials.pass);
            user_ok & pass_ok
        }
        None => false,
    }
}

/// Constant-time string comparison via keyed digests of both sides.
fn constant_time_eq(given: &str, expected: &str) -> bool {
    let digest = |value: &str| {
        let mut mac = Hmac::<Sha256>::new_from_slice(expected.as_bytes()).ok()?;
        mac.update(value.as_bytes());
        Some(mac)
    };
    match (digest(given), digest(expected)) {
        (Some(lhs), Some(rhs)) => lhs.verify_slice(&rhs.finalize().into_bytes()).is_ok(),
        _ => false,
    }
}
