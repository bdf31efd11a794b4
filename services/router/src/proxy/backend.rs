//! Backend connection management.
//!
//! Connections are HTTP/1.1 client handshakes over plain TCP or TLS. Idle
//! keep-alive connections are kept per target and handed out one request at
//! a time; a connection goes back to the idle list only once its response
//! body has been read to the end without error.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Request, Response};
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use super::error::DialError;
use crate::registry::{Endpoint, InFlightGuard};

/// Body type flowing through the proxy in both directions.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Stream to a backend, plain or TLS.
pub trait BackendIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> BackendIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedIo = Box<dyn BackendIo>;

/// Where a connection goes. Also the idle-pool key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendTarget {
    pub host: String,
    pub port: u16,
    /// Name to verify in the server certificate; `None` for plain TCP.
    pub tls_server_name: Option<String>,
}

impl BackendTarget {
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls_server_name: None,
        }
    }

    pub fn tls(host: impl Into<String>, port: u16, server_name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            tls_server_name: Some(server_name.into()),
        }
    }

    pub fn for_endpoint(endpoint: &Endpoint) -> Self {
        if endpoint.tls {
            let name = endpoint
                .server_cert_domain_san
                .clone()
                .unwrap_or_else(|| endpoint.host.clone());
            Self::tls(endpoint.host.clone(), endpoint.port, name)
        } else {
            Self::plain(endpoint.host.clone(), endpoint.port)
        }
    }

    fn dial_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls_server_name.is_some() {
            "https"
        } else {
            "http"
        };
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "{scheme}://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{scheme}://{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections kept per target; 0 disables keep-alive reuse.
    pub max_idle_per_target: usize,
    /// Idle connections older than this are closed instead of reused.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_target: 32,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

struct IdleConnection {
    sender: SendRequest<ProxyBody>,
    idle_since: Instant,
}

/// Idle keep-alive connections by target.
pub struct ConnectionPool {
    idle: Mutex<HashMap<BackendTarget, Vec<IdleConnection>>>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Number of idle connections for a target.
    pub fn idle_count(&self, target: &BackendTarget) -> usize {
        let idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.get(target).map_or(0, Vec::len)
    }

    fn take(&self, target: &BackendTarget) -> Option<SendRequest<ProxyBody>> {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        let conns = idle.get_mut(target)?;
        while let Some(conn) = conns.pop() {
            if conn.sender.is_closed() || conn.idle_since.elapsed() > self.config.idle_timeout {
                continue;
            }
            return Some(conn.sender);
        }
        idle.remove(target);
        None
    }

    fn put(&self, target: BackendTarget, sender: SendRequest<ProxyBody>) {
        if self.config.max_idle_per_target == 0 || sender.is_closed() {
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        let conns = idle.entry(target).or_default();
        conns.retain(|c| !c.sender.is_closed());
        if conns.len() < self.config.max_idle_per_target {
            conns.push(IdleConnection {
                sender,
                idle_since: Instant::now(),
            });
        }
    }
}

/// Dials backends and hands out pooled connections.
pub struct BackendConnector {
    connect_timeout: Duration,
    tls: TlsConnector,
    pool: Arc<ConnectionPool>,
}

impl BackendConnector {
    pub fn new(connect_timeout: Duration, tls: TlsConnector, pool: PoolConfig) -> Self {
        Self {
            connect_timeout,
            tls,
            pool: Arc::new(ConnectionPool::new(pool)),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Open a transport to the target. The timeout covers TCP connect and
    /// the TLS handshake.
    pub async fn dial(&self, target: &BackendTarget) -> Result<BoxedIo, DialError> {
        let connect = async {
            let stream = TcpStream::connect((target.dial_host(), target.port)).await?;
            stream.set_nodelay(true)?;

            match &target.tls_server_name {
                None => Ok(Box::new(stream) as BoxedIo),
                Some(name) => {
                    let server_name = ServerName::try_from(name.clone())
                        .map_err(|e| DialError::Tls(e.to_string()))?;
                    let tls = self
                        .tls
                        .connect(server_name, stream)
                        .await
                        .map_err(|e| DialError::Tls(e.to_string()))?;
                    Ok(Box::new(tls) as BoxedIo)
                }
            }
        };

        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(DialError::Timeout),
        }
    }

    /// An idle connection to the target, or a freshly dialled one.
    pub async fn checkout(&self, target: &BackendTarget) -> Result<PooledConnection, DialError> {
        while let Some(mut sender) = self.pool.take(target) {
            match tokio::time::timeout(self.connect_timeout, sender.ready()).await {
                Ok(Ok(())) => {
                    trace!(target = %target, "Reusing idle backend connection");
                    return Ok(PooledConnection {
                        target: target.clone(),
                        sender,
                        pool: Arc::clone(&self.pool),
                        reused: true,
                    });
                }
                _ => trace!(target = %target, "Discarding dead idle connection"),
            }
        }

        let io = self.dial(target).await?;
        let (sender, conn) = http1::handshake::<_, ProxyBody>(TokioIo::new(io)).await?;
        let label = target.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(target = %label, error = %e, "Backend connection closed with error");
            }
        });

        Ok(PooledConnection {
            target: target.clone(),
            sender,
            pool: Arc::clone(&self.pool),
            reused: false,
        })
    }

    /// A dedicated connection able to switch protocols. Never pooled.
    pub async fn connect_upgradeable(
        &self,
        target: &BackendTarget,
    ) -> Result<SendRequest<ProxyBody>, DialError> {
        let io = self.dial(target).await?;
        let (sender, conn) = http1::handshake::<_, ProxyBody>(TokioIo::new(io)).await?;
        let label = target.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(target = %label, error = %e, "Upgrade connection closed with error");
            }
        });
        Ok(sender)
    }
}

/// A request that failed to get a response.
#[derive(Debug)]
pub struct SendFailure {
    /// Returned when the connection failed before any of it was written.
    pub request: Option<Request<ProxyBody>>,
    pub error: hyper::Error,
}

/// A connection checked out for exactly one request.
pub struct PooledConnection {
    target: BackendTarget,
    sender: SendRequest<ProxyBody>,
    pool: Arc<ConnectionPool>,
    reused: bool,
}

impl PooledConnection {
    /// Whether this came from the idle list rather than a fresh dial.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub async fn send(
        mut self,
        request: Request<ProxyBody>,
    ) -> Result<Response<PooledBody>, SendFailure> {
        match self.sender.try_send_request(request).await {
            Ok(response) => {
                let release = Release {
                    pool: self.pool,
                    target: self.target,
                    sender: self.sender,
                };
                Ok(response.map(|body| PooledBody::new(body.boxed_unsync(), Some(release))))
            }
            Err(mut e) => Err(SendFailure {
                request: e.take_message(),
                error: e.into_error(),
            }),
        }
    }
}

struct Release {
    pool: Arc<ConnectionPool>,
    target: BackendTarget,
    sender: SendRequest<ProxyBody>,
}

/// Response body that returns its connection to the pool once fully read.
///
/// Dropping it early, or any read error, discards the connection. It also
/// holds the endpoint's in-flight guard so the request counts as in flight
/// until the body is done.
pub struct PooledBody {
    inner: ProxyBody,
    release: Option<Box<Release>>,
    in_flight: Option<InFlightGuard>,
}

impl PooledBody {
    fn new(inner: ProxyBody, release: Option<Release>) -> Self {
        let mut body = Self {
            inner,
            release: release.map(Box::new),
            in_flight: None,
        };
        if body.inner.is_end_stream() {
            body.finish();
        }
        body
    }

    pub fn with_in_flight(mut self, guard: Option<InFlightGuard>) -> Self {
        if self.release.is_some() || !self.inner.is_end_stream() {
            self.in_flight = guard;
        }
        self
    }

    fn finish(&mut self) {
        if let Some(release) = self.release.take() {
            let Release {
                pool,
                target,
                sender,
            } = *release;
            pool.put(target, sender);
        }
        self.in_flight = None;
    }
}

impl Body for PooledBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));
        match &frame {
            None => this.finish(),
            Some(Err(_)) => {
                this.release = None;
                this.in_flight = None;
            }
            Some(Ok(_)) if this.inner.is_end_stream() => this.finish(),
            Some(Ok(_)) => {}
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
