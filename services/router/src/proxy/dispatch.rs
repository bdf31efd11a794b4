//! Per-request proxy pipeline.
//!
//! ```text
//! classify -> health probe? -> Host -> registry lookup -> route service?
//!          -> select endpoint -> connect -> exchange | upgrade -> relay
//! ```
//!
//! Every request produces exactly one access record on the
//! `beacon_router::access` target.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Empty, Full};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tracing::{debug, info, info_span, warn, Instrument};

use super::backend::{BackendConnector, BackendTarget, PooledBody, ProxyBody, SendFailure};
use super::error::{DialError, DispatchError};
use super::request::{
    add_forwarding_headers, affinity_id, classify, has_conflicting_framing, is_idempotent,
    request_host, strip_hop_by_hop, RequestKind, Scheme, UpgradeProtocol, X_REQUEST_ID,
};
use super::selector::{EndpointSelector, Selection};
use super::tunnel;
use crate::drain::{self, DrainCoordinator};
use crate::registry::{normalize_host, Endpoint, EndpointKey, InFlightGuard, RoutePool, RouteRegistry};
use crate::route_service::{RouteServiceSigner, FORWARDED_URL_HEADER, SIGNATURE_HEADER};

pub const DEFAULT_HEALTH_CHECK_USER_AGENT: &str = "HTTP-Monitor/1.1";
pub const DEFAULT_AFFINITY_COOKIE: &str = "__beacon_instance_id";
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub health_check_user_agent: String,
    /// Cookie carrying the private instance id for sticky sessions.
    pub affinity_cookie: String,
    /// Attempts per request, counting the first.
    pub max_attempts: usize,
    /// Time allowed from sending the request to receiving the response head.
    pub response_timeout: Duration,
    /// Close a tunnel after this long with no traffic in either direction.
    pub tunnel_idle_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            health_check_user_agent: DEFAULT_HEALTH_CHECK_USER_AGENT.to_string(),
            affinity_cookie: DEFAULT_AFFINITY_COOKIE.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            tunnel_idle_timeout: None,
        }
    }
}

/// Facts about the client connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionContext {
    pub peer: SocketAddr,
    pub scheme: Scheme,
}

/// Where a request is sent after routing.
enum Destination {
    /// A registered pool; an endpoint is selected per attempt.
    Pool(Arc<RoutePool>),
    /// An external route service, dialled directly.
    Direct(BackendTarget),
}

enum Pick {
    Target(BackendTarget, Option<Arc<Endpoint>>),
    Exhausted,
    AtCapacity,
}

enum AttemptError {
    /// Nothing reached the backend; the request may go elsewhere.
    NotSent {
        request: Request<ProxyBody>,
        error: DispatchError,
    },
    Failed(DispatchError),
}

pub struct Dispatcher {
    registry: Arc<RouteRegistry>,
    selector: EndpointSelector,
    connector: Arc<BackendConnector>,
    route_services: RouteServiceSigner,
    drain: Arc<DrainCoordinator>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<RouteRegistry>,
        selector: EndpointSelector,
        connector: Arc<BackendConnector>,
        route_services: RouteServiceSigner,
        drain: Arc<DrainCoordinator>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            selector,
            connector,
            route_services,
            drain,
            config,
        }
    }

    pub fn drain(&self) -> &Arc<DrainCoordinator> {
        &self.drain
    }

    /// Proxy one request. Never fails: errors become status responses.
    pub async fn dispatch(
        &self,
        req: Request<ProxyBody>,
        ctx: ConnectionContext,
    ) -> Response<ProxyBody> {
        let started = Instant::now();
        let mut record = AccessRecord::new(&req, ctx);

        let response = match self.handle(req, ctx, &mut record).await {
            Ok(response) => response,
            Err(err) => {
                match err.status() {
                    StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
                        debug!(error = %err, "Request rejected")
                    }
                    _ => warn!(error = %err, host = %record.host, "Request failed"),
                }
                record.error = Some(err.kind());
                status_response(err.status())
            }
        };

        record.emit(response.status(), started.elapsed());
        response
    }

    async fn handle(
        &self,
        mut req: Request<ProxyBody>,
        ctx: ConnectionContext,
        record: &mut AccessRecord,
    ) -> Result<Response<ProxyBody>, DispatchError> {
        let kind = classify(&req, &self.config.health_check_user_agent);
        if kind == RequestKind::HealthCheck {
            record.route = Some("health-check".to_string());
            return Ok(self.health_response());
        }

        let host =
            request_host(&req).ok_or(DispatchError::BadRequest("missing or invalid Host"))?;
        record.host = host.clone();
        let path = req.uri().path().to_string();

        let pool = self
            .registry
            .lookup(&host, &path)
            .await
            .ok_or_else(|| DispatchError::NoRoute(format!("{host}{path}")))?;
        record.route = Some(pool.uri().to_string());

        let forwarded_url = forwarded_url(&req, ctx.scheme);
        prepare_request(&mut req, kind, ctx, &record.request_id);

        let destination = match pool.route_service_url().await {
            Some(route_service) => {
                self.route_service_destination(&mut req, &route_service, &host, forwarded_url, pool)
                    .await?
            }
            None => Destination::Pool(pool),
        };

        match kind {
            RequestKind::Upgrade(protocol) => {
                self.forward_upgrade(req, destination, protocol, record).await
            }
            _ => self.forward(req, destination, record).await,
        }
    }

    fn health_response(&self) -> Response<ProxyBody> {
        if self.drain.is_running() {
            let mut response = Response::new(full("ok\n"));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            response
        } else {
            status_response(StatusCode::SERVICE_UNAVAILABLE)
        }
    }

    /// Decide between the route service and the application for a pool
    /// bound to a route service.
    async fn route_service_destination(
        &self,
        req: &mut Request<ProxyBody>,
        route_service: &str,
        host: &str,
        forwarded_url: String,
        app_pool: Arc<RoutePool>,
    ) -> Result<Destination, DispatchError> {
        if let Some(signature) = header_string(req, SIGNATURE_HEADER) {
            let signed_url = header_string(req, FORWARDED_URL_HEADER);
            self.route_services
                .verify(&signature, signed_url.as_deref(), host, SystemTime::now())?;
            req.headers_mut().remove(SIGNATURE_HEADER);
            req.headers_mut().remove(FORWARDED_URL_HEADER);
            debug!(host, "Route service signature verified; forwarding to application");
            return Ok(Destination::Pool(app_pool));
        }

        let signature = self
            .route_services
            .sign(&forwarded_url, SystemTime::now())?;

        let target: Uri = route_service.parse().map_err(|_| {
            DispatchError::UpstreamProtocolError(format!(
                "invalid route service URL {route_service}"
            ))
        })?;
        let authority = target.authority().ok_or_else(|| {
            DispatchError::UpstreamProtocolError(format!(
                "route service URL has no host: {route_service}"
            ))
        })?;
        let service_host = normalize_host(authority.host()).ok_or_else(|| {
            DispatchError::UpstreamProtocolError(format!(
                "route service URL has invalid host: {route_service}"
            ))
        })?;
        let https = target.scheme_str() == Some("https");
        let port = target.port_u16().unwrap_or(if https { 443 } else { 80 });

        *req.uri_mut() = origin_form(&target);
        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
            headers.insert(header::HOST, value);
        }
        if let Ok(value) = HeaderValue::from_str(&signature) {
            headers.insert(SIGNATURE_HEADER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&forwarded_url) {
            headers.insert(FORWARDED_URL_HEADER, value);
        }

        if let Some(service_pool) = self.registry.lookup(&service_host, target.path()).await {
            debug!(route_service, "Forwarding to registered route service");
            return Ok(Destination::Pool(service_pool));
        }

        debug!(route_service, "Forwarding to external route service");
        Ok(Destination::Direct(if https {
            BackendTarget::tls(authority.host(), port, service_host)
        } else {
            BackendTarget::plain(authority.host(), port)
        }))
    }

    async fn pick(
        &self,
        destination: &Destination,
        affinity: Option<&str>,
        tried: &[EndpointKey],
    ) -> Pick {
        match destination {
            Destination::Direct(target) => Pick::Target(target.clone(), None),
            Destination::Pool(pool) => match self.selector.select(pool, affinity, tried).await {
                Selection::Selected(endpoint) => {
                    Pick::Target(BackendTarget::for_endpoint(&endpoint), Some(endpoint))
                }
                Selection::Exhausted => Pick::Exhausted,
                Selection::AtCapacity => Pick::AtCapacity,
            },
        }
    }

    /// Plain request/response proxying with retries on dial failure.
    async fn forward(
        &self,
        req: Request<ProxyBody>,
        destination: Destination,
        record: &mut AccessRecord,
    ) -> Result<Response<ProxyBody>, DispatchError> {
        let affinity = affinity_id(req.headers(), &self.config.affinity_cookie);
        let retryable = is_idempotent(req.method());
        let max_attempts = self.config.max_attempts.max(1);
        let mut tried: Vec<EndpointKey> = Vec::new();
        let mut last_error: Option<DispatchError> = None;
        let mut pending = req;

        while record.attempts < max_attempts {
            let (target, endpoint) = match self.pick(&destination, affinity.as_deref(), &tried).await {
                Pick::Target(target, endpoint) => (target, endpoint),
                Pick::AtCapacity => return Err(last_error.unwrap_or(DispatchError::NoCapacity)),
                Pick::Exhausted => break,
            };
            record.attempts += 1;
            record.note_target(&target, endpoint.as_deref());
            if let Some(endpoint) = &endpoint {
                tried.push(endpoint.key());
            }
            let in_flight = endpoint.as_ref().map(|e| e.stats.begin_request());

            match self.exchange(&target, pending, record).await {
                Ok(response) => {
                    if let Some(endpoint) = &endpoint {
                        endpoint
                            .stats
                            .record_success(record.ttfb.unwrap_or_default());
                    }
                    return Ok(relay(response, in_flight));
                }
                Err(AttemptError::NotSent { request, error }) => {
                    if let Some(endpoint) = &endpoint {
                        endpoint.stats.record_dial_failure();
                    }
                    warn!(
                        backend = %target,
                        attempt = record.attempts,
                        error = %error,
                        "Backend connection failed"
                    );
                    last_error = Some(error);
                    if !retryable {
                        break;
                    }
                    pending = request;
                }
                Err(AttemptError::Failed(error)) => {
                    if let Some(endpoint) = &endpoint {
                        endpoint.stats.record_failure();
                    }
                    return Err(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DispatchError::NoRoute(record.target_label())))
    }

    /// One request on one connection.
    ///
    /// A pooled connection found dead before anything was written is
    /// replaced by a fresh dial to the same target without using up an
    /// attempt.
    async fn exchange(
        &self,
        target: &BackendTarget,
        mut request: Request<ProxyBody>,
        record: &mut AccessRecord,
    ) -> Result<Response<PooledBody>, AttemptError> {
        loop {
            let dial_started = Instant::now();
            let conn = match self.connector.checkout(target).await {
                Ok(conn) => conn,
                Err(error) => {
                    return Err(AttemptError::NotSent {
                        request,
                        error: error.into(),
                    })
                }
            };
            record.dial = Some(dial_started.elapsed());
            let reused = conn.is_reused();

            let sent_at = Instant::now();
            match tokio::time::timeout(self.config.response_timeout, conn.send(request)).await {
                Err(_) => return Err(AttemptError::Failed(DispatchError::ResponseTimeout)),
                Ok(Ok(response)) => {
                    record.ttfb = Some(sent_at.elapsed());
                    if has_conflicting_framing(response.headers()) {
                        return Err(AttemptError::Failed(DispatchError::UpstreamProtocolError(
                            "conflicting message framing".to_string(),
                        )));
                    }
                    return Ok(response);
                }
                Ok(Err(SendFailure {
                    request: Some(returned),
                    error,
                })) => {
                    if reused {
                        debug!(backend = %target, error = %error, "Idle connection was dead; redialling");
                        request = returned;
                        continue;
                    }
                    return Err(AttemptError::NotSent {
                        request: returned,
                        error: DispatchError::BackendDialFailure(DialError::Handshake(error)),
                    });
                }
                Ok(Err(SendFailure {
                    request: None,
                    error,
                })) => return Err(AttemptError::Failed(upstream_error(error))),
            }
        }
    }

    /// Protocol upgrade over a dedicated connection.
    async fn forward_upgrade(
        &self,
        mut req: Request<ProxyBody>,
        destination: Destination,
        protocol: UpgradeProtocol,
        record: &mut AccessRecord,
    ) -> Result<Response<ProxyBody>, DispatchError> {
        let client_upgrade = hyper::upgrade::on(&mut req);
        let affinity = affinity_id(req.headers(), &self.config.affinity_cookie);
        let max_attempts = self.config.max_attempts.max(1);
        let mut tried: Vec<EndpointKey> = Vec::new();
        let mut last_error: Option<DispatchError> = None;

        while record.attempts < max_attempts {
            let (target, endpoint) = match self.pick(&destination, affinity.as_deref(), &tried).await {
                Pick::Target(target, endpoint) => (target, endpoint),
                Pick::AtCapacity => return Err(last_error.unwrap_or(DispatchError::NoCapacity)),
                Pick::Exhausted => break,
            };
            record.attempts += 1;
            record.note_target(&target, endpoint.as_deref());
            if let Some(endpoint) = &endpoint {
                tried.push(endpoint.key());
            }

            let dial_started = Instant::now();
            let mut sender = match self.connector.connect_upgradeable(&target).await {
                Ok(sender) => sender,
                Err(error) => {
                    if let Some(endpoint) = &endpoint {
                        endpoint.stats.record_dial_failure();
                    }
                    warn!(backend = %target, attempt = record.attempts, error = %error, "Backend connection failed");
                    last_error = Some(error.into());
                    continue;
                }
            };
            record.dial = Some(dial_started.elapsed());
            if let Some(endpoint) = &endpoint {
                endpoint.stats.record_dial_success();
            }
            let in_flight = endpoint.as_ref().map(|e| e.stats.begin_request());

            let sent_at = Instant::now();
            let mut response =
                match tokio::time::timeout(self.config.response_timeout, sender.send_request(req))
                    .await
                {
                    Ok(Ok(response)) => response,
                    Ok(Err(error)) => {
                        if let Some(endpoint) = &endpoint {
                            endpoint.stats.record_failure();
                        }
                        return Err(upstream_error(error));
                    }
                    Err(_) => {
                        if let Some(endpoint) = &endpoint {
                            endpoint.stats.record_failure();
                        }
                        return Err(DispatchError::ResponseTimeout);
                    }
                };
            record.ttfb = Some(sent_at.elapsed());
            if let Some(endpoint) = &endpoint {
                endpoint.stats.record_success(sent_at.elapsed());
            }

            if response.status() != StatusCode::SWITCHING_PROTOCOLS {
                debug!(
                    backend = %target,
                    status = %response.status(),
                    "Backend refused upgrade; closing client connection"
                );
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers, false);
                parts
                    .headers
                    .insert(header::CONNECTION, HeaderValue::from_static("close"));
                return Ok(Response::from_parts(parts, body.boxed_unsync()));
            }

            let backend_upgrade = hyper::upgrade::on(&mut response);
            self.spawn_tunnel(client_upgrade, backend_upgrade, in_flight, protocol, &target);
            let (parts, _) = response.into_parts();
            return Ok(Response::from_parts(parts, empty()));
        }

        Err(last_error.unwrap_or_else(|| DispatchError::NoRoute(record.target_label())))
    }

    fn spawn_tunnel(
        &self,
        client: OnUpgrade,
        backend: OnUpgrade,
        in_flight: Option<InFlightGuard>,
        protocol: UpgradeProtocol,
        target: &BackendTarget,
    ) {
        let drain_guard = self.drain.track();
        let mut drain_state = self.drain.subscribe();
        let idle_timeout = self.config.tunnel_idle_timeout;
        let span = info_span!("tunnel", protocol = protocol.as_str(), backend = %target);

        tokio::spawn(
            async move {
                let _drain_guard = drain_guard;
                let _in_flight = in_flight;

                let (client, backend) = match tokio::try_join!(client, backend) {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!(error = %e, "Protocol upgrade did not complete");
                        return;
                    }
                };

                tokio::select! {
                    result = tunnel::splice(TokioIo::new(client), TokioIo::new(backend), idle_timeout) => {
                        match result {
                            Ok(stats) => debug!(
                                bytes_to_backend = stats.client_to_backend,
                                bytes_from_backend = stats.backend_to_client,
                                "Tunnel closed"
                            ),
                            Err(e) => debug!(error = %e, "Tunnel closed with error"),
                        }
                    }
                    _ = drain::stopped(&mut drain_state) => {
                        info!("Closing tunnel at drain deadline");
                    }
                }
            }
            .instrument(span),
        );
    }
}

/// Hop-by-hop cleanup, forwarding headers and origin-form target.
fn prepare_request(
    req: &mut Request<ProxyBody>,
    kind: RequestKind,
    ctx: ConnectionContext,
    request_id: &str,
) {
    let keep_upgrade = matches!(kind, RequestKind::Upgrade(_));
    if !req.headers().contains_key(header::HOST) {
        if let Some(authority) = req.uri().authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                req.headers_mut().insert(header::HOST, value);
            }
        }
    }

    let headers = req.headers_mut();
    strip_hop_by_hop(headers, keep_upgrade);
    add_forwarding_headers(headers, ctx.peer, ctx.scheme, request_id);

    let target = origin_form(req.uri());
    *req.uri_mut() = target;
}

fn relay(response: Response<PooledBody>, in_flight: Option<InFlightGuard>) -> Response<ProxyBody> {
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers, false);
    Response::from_parts(parts, body.with_in_flight(in_flight).boxed_unsync())
}

/// URL the client asked for, as signed for route services.
fn forwarded_url(req: &Request<ProxyBody>, scheme: Scheme) -> String {
    let authority = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{}://{}{}", scheme.as_str(), authority, path)
}

fn origin_form(uri: &Uri) -> Uri {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    path.parse().unwrap_or_else(|_| Uri::from_static("/"))
}

fn header_string(req: &Request<ProxyBody>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn upstream_error(error: hyper::Error) -> DispatchError {
    if error.is_timeout() {
        DispatchError::ResponseTimeout
    } else {
        DispatchError::UpstreamProtocolError(error.to_string())
    }
}

fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Status-only response with the canonical reason as body.
pub fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let reason = status.canonical_reason().unwrap_or("");
    let mut response = Response::new(full(format!("{} {}\n", status.as_u16(), reason)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Fields of one access log line.
struct AccessRecord {
    request_id: String,
    method: Method,
    host: String,
    path: String,
    peer: SocketAddr,
    route: Option<String>,
    backend: Option<String>,
    app_id: Option<String>,
    instance_id: Option<String>,
    attempts: usize,
    error: Option<&'static str>,
    dial: Option<Duration>,
    ttfb: Option<Duration>,
}

impl AccessRecord {
    fn new(req: &Request<ProxyBody>, ctx: ConnectionContext) -> Self {
        let request_id = req
            .headers()
            .get(&X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            request_id,
            method: req.method().clone(),
            host: String::new(),
            path: req.uri().path().to_string(),
            peer: ctx.peer,
            route: None,
            backend: None,
            app_id: None,
            instance_id: None,
            attempts: 0,
            error: None,
            dial: None,
            ttfb: None,
        }
    }

    fn note_target(&mut self, target: &BackendTarget, endpoint: Option<&Endpoint>) {
        self.backend = Some(target.to_string());
        self.app_id = endpoint
            .map(|e| e.app_id.clone())
            .filter(|id| !id.is_empty());
        self.instance_id = endpoint.and_then(|e| e.private_instance_id.clone());
    }

    fn target_label(&self) -> String {
        self.route.clone().unwrap_or_else(|| self.host.clone())
    }

    fn emit(&self, status: StatusCode, total: Duration) {
        info!(
            target: "beacon_router::access",
            request_id = %self.request_id,
            method = %self.method,
            host = %self.host,
            path = %self.path,
            peer = %self.peer,
            status = status.as_u16(),
            route = self.route.as_deref().unwrap_or("-"),
            backend = self.backend.as_deref().unwrap_or("-"),
            app_id = self.app_id.as_deref().unwrap_or("-"),
            instance_id = self.instance_id.as_deref().unwrap_or("-"),
            attempts = self.attempts,
            error = self.error.unwrap_or("-"),
            dial_ms = self.dial.map(|d| d.as_millis() as u64).unwrap_or(0),
            ttfb_ms = self.ttfb.map(|d| d.as_millis() as u64).unwrap_or(0),
            total_ms = total.as_millis() as u64,
            "request"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::proxy::backend::PoolConfig;
    use crate::proxy::selector::SelectorConfig;
    use crate::tls::{client_connector, ClientTlsSettings};

    fn dispatcher() -> (Arc<RouteRegistry>, Arc<DrainCoordinator>, Dispatcher) {
        let registry = Arc::new(RouteRegistry::new(
            Arc::new(ManualClock::new()),
            Duration::from_secs(120),
        ));
        let drain = DrainCoordinator::new(Duration::from_secs(1));
        let tls = client_connector(&ClientTlsSettings {
            skip_verification: true,
            ..Default::default()
        })
        .unwrap();
        let connector = Arc::new(BackendConnector::new(
            Duration::from_millis(500),
            tls,
            PoolConfig::default(),
        ));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            EndpointSelector::new(SelectorConfig::default()),
            connector,
            RouteServiceSigner::disabled(),
            drain.clone(),
            DispatcherConfig::default(),
        );
        (registry, drain, dispatcher)
    }

    fn ctx() -> ConnectionContext {
        ConnectionContext {
            peer: "127.0.0.1:40000".parse().unwrap(),
            scheme: Scheme::Http,
        }
    }

    fn request(host: Option<&str>, user_agent: Option<&str>) -> Request<ProxyBody> {
        let mut builder = Request::builder().uri("/some/path");
        if let Some(host) = host {
            builder = builder.header("host", host);
        }
        if let Some(ua) = user_agent {
            builder = builder.header("user-agent", ua);
        }
        builder.body(empty()).unwrap()
    }

    async fn body_string(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_check_ignores_host() {
        let (_, drain, dispatcher) = dispatcher();

        let response = dispatcher
            .dispatch(request(None, Some(DEFAULT_HEALTH_CHECK_USER_AGENT)), ctx())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "ok\n");

        drain.begin_drain();
        let response = dispatcher
            .dispatch(request(None, Some(DEFAULT_HEALTH_CHECK_USER_AGENT)), ctx())
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_missing_host_is_bad_request() {
        let (_, _, dispatcher) = dispatcher();
        let response = dispatcher.dispatch(request(None, None), ctx()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = dispatcher.dispatch(request(Some("bad host"), None), ctx()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_host_is_not_found() {
        let (_, _, dispatcher) = dispatcher();
        let response = dispatcher
            .dispatch(request(Some("nothing.example.test"), None), ctx())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, "404 Not Found\n");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_bad_gateway() {
        let (registry, _, dispatcher) = dispatcher();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        registry
            .register(
                crate::registry::RouteUri::parse("dead.example.test").unwrap(),
                Endpoint::new("127.0.0.1", port),
            )
            .await;

        let response = dispatcher
            .dispatch(request(Some("dead.example.test"), None), ctx())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let pool = registry.lookup("dead.example.test", "/").await.unwrap();
        let endpoint = &pool.endpoints().await[0];
        assert_eq!(endpoint.stats.consecutive_failures(), 1);
        assert_eq!(endpoint.stats.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_route_service_without_secret_is_bad_gateway() {
        let (registry, _, dispatcher) = dispatcher();
        registry
            .register(
                crate::registry::RouteUri::parse("rs.example.test").unwrap(),
                Endpoint::new("127.0.0.1", 9).with_route_service_url("https://filter.example.test"),
            )
            .await;

        let response = dispatcher
            .dispatch(request(Some("rs.example.test"), None), ctx())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_forwarded_url_uses_host_header() {
        let req = Request::builder()
            .uri("/a/b?c=1")
            .header("host", "demo.example.test:8080")
            .body(empty())
            .unwrap();
        assert_eq!(
            forwarded_url(&req, Scheme::Https),
            "https://demo.example.test:8080/a/b?c=1"
        );
    }

    #[test]
    fn test_prepare_request_rewrites_target() {
        let mut req = Request::builder()
            .uri("http://demo.example.test/x?y=1")
            .header("connection", "keep-alive")
            .body(empty())
            .unwrap();
        prepare_request(&mut req, RequestKind::Plain, ctx(), "req-7");

        assert_eq!(req.uri(), "/x?y=1");
        assert_eq!(req.headers()["host"], "demo.example.test");
        assert_eq!(req.headers()["x-request-id"], "req-7");
        assert_eq!(req.headers()["x-forwarded-for"], "127.0.0.1");
        assert!(req.headers().get("connection").is_none());
    }
}
