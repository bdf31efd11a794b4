//! Client-facing listeners.
//!
//! Each accepted connection gets its own task that serves HTTP/1.1 (with
//! upgrades) through the [`Dispatcher`]. TLS listeners terminate TLS first.
//! When a drain starts the accept loop returns, dropping the socket, and
//! every open connection is asked to finish its current request and close.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::Request;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn, Instrument};

use super::dispatch::{ConnectionContext, Dispatcher};
use super::request::Scheme;
use crate::drain::{self, DrainState};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default time allowed for a client TLS handshake.
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Terminate TLS with this acceptor; plain HTTP when `None`.
    pub tls: Option<TlsAcceptor>,
    pub tls_handshake_timeout: Duration,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            tls: None,
            tls_handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    fn scheme(&self) -> Scheme {
        if self.tls.is_some() {
            Scheme::Https
        } else {
            Scheme::Http
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently open.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Client TLS handshakes that failed or timed out.
    pub tls_handshake_failed: AtomicU64,
}

/// An HTTP(S) listener feeding the dispatcher.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    pub async fn bind(config: ListenerConfig, dispatcher: Arc<Dispatcher>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            scheme = config.scheme().as_str(),
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            dispatcher,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until a drain starts.
    ///
    /// Consumes the listener so the socket is closed as soon as this returns.
    pub async fn run(self) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        let mut drain_state = self.dispatcher.drain().subscribe();
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            let accepted = tokio::select! {
                _ = drain::draining(&mut drain_state) => {
                    info!(bind_addr = %local_addr, "Listener closed for drain");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let permit = match Arc::clone(&self.conn_semaphore).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let drain_guard = self.dispatcher.drain().track();
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let config = self.config.clone();
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) =
                                handle_connection(stream, peer_addr, &config, dispatcher, &stats).await
                            {
                                debug!(peer_addr = %peer_addr, error = %e, "Connection error");
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(drain_guard);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: &ListenerConfig,
    dispatcher: Arc<Dispatcher>,
    stats: &ListenerStats,
) -> Result<(), hyper::Error> {
    let _ = stream.set_nodelay(true);
    let ctx = ConnectionContext {
        peer,
        scheme: config.scheme(),
    };

    match &config.tls {
        None => serve_http(TokioIo::new(stream), ctx, dispatcher).await,
        Some(acceptor) => {
            let handshake =
                tokio::time::timeout(config.tls_handshake_timeout, acceptor.accept(stream)).await;
            let tls = match handshake {
                Ok(Ok(tls)) => tls,
                Ok(Err(e)) => {
                    stats.tls_handshake_failed.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, "TLS handshake failed");
                    return Ok(());
                }
                Err(_) => {
                    stats.tls_handshake_failed.fetch_add(1, Ordering::Relaxed);
                    debug!("TLS handshake timed out");
                    return Ok(());
                }
            };
            serve_http(TokioIo::new(tls), ctx, dispatcher).await
        }
    }
}

/// Serve HTTP/1.1 on one connection, following the drain state.
async fn serve_http<I>(
    io: I,
    ctx: ConnectionContext,
    dispatcher: Arc<Dispatcher>,
) -> Result<(), hyper::Error>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let mut drain_state = dispatcher.drain().subscribe();
    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            let req = req.map(|body| body.boxed_unsync());
            Ok::<_, Infallible>(dispatcher.dispatch(req, ctx).await)
        }
    });

    let conn = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(conn);

    let initial = *drain_state.borrow();
    match initial {
        DrainState::Running => {}
        DrainState::Draining => conn.as_mut().graceful_shutdown(),
        DrainState::Stopped => return Ok(()),
    }

    loop {
        tokio::select! {
            result = conn.as_mut() => return result,
            changed = drain_state.changed() => {
                let state = if changed.is_err() {
                    DrainState::Stopped
                } else {
                    *drain_state.borrow_and_update()
                };
                match state {
                    DrainState::Running => {}
                    DrainState::Draining => conn.as_mut().graceful_shutdown(),
                    DrainState::Stopped => {
                        debug!("Closing connection at drain deadline");
                        return Ok(());
                    }
                }
            }
        }
    }
}
