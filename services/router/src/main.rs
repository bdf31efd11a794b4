//! beacon router
//!
//! This service:
//! - Keeps a route table fed by `router.register` / `router.unregister` heartbeats
//! - Prunes endpoints whose heartbeats go stale
//! - Proxies HTTP(S) and upgraded connections to registered backends
//! - Serves `/routes` and `/healthz` on the status port
//! - Drains gracefully on SIGUSR1 and stops on SIGTERM/SIGINT

use std::sync::Arc;

use anyhow::{Context, Result};
use beacon_events::RouterGreeting;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use beacon_router::admin::{self, AdminState, BasicCredentials};
use beacon_router::bus::{InProcessBus, MessageBus, RegistrySubscriber, SubscriberConfig};
use beacon_router::clock::SystemClock;
use beacon_router::config::Config;
use beacon_router::drain::{self, DrainCoordinator, DrainOutcome};
use beacon_router::proxy::{
    BackendConnector, Dispatcher, DispatcherConfig, EndpointSelector, Listener, ListenerConfig,
    PoolConfig, SelectorConfig,
};
use beacon_router::registry::{PruneConfig, Pruner, RouteRegistry};
use beacon_router::route_service::RouteServiceSigner;
use beacon_router::routing_api::{self, RouterGroups, RoutingApiClient};
use beacon_router::tls::{self, ClientTlsSettings};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Invalid router configuration")?;

    // Initialize tracing (prefer RUST_LOG, fallback to BEACON_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting beacon router");
    info!(
        http_addr = %config.http_addr,
        tls_addr = ?config.tls_addr,
        status_addr = %config.status_addr,
        stale_threshold_secs = config.stale_threshold.as_secs(),
        prune_interval_secs = config.prune_interval.as_secs(),
        suspend_pruning = config.suspend_pruning_if_bus_unavailable,
        backend_tls = config.backend_tls_enabled,
        route_services = config.route_service_secret.is_some(),
        isolation_segments = ?config.isolation_segments,
        sharding_mode = %config.sharding_mode,
        routing_api = config.routing_api_url.is_some(),
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let registry = Arc::new(RouteRegistry::new(
        Arc::new(SystemClock),
        config.stale_threshold,
    ));
    let drain = DrainCoordinator::new(config.drain_timeout);
    let bus = Arc::new(InProcessBus::new());

    // Router groups must be readable before serving traffic.
    if let Some(url) = &config.routing_api_url {
        let client = RoutingApiClient::new(
            url,
            config.routing_api_token.as_deref(),
            routing_api::DEFAULT_REQUEST_TIMEOUT,
        )
        .context("Failed to build routing API client")?;
        let groups = RouterGroups::bootstrap(Arc::new(client), config.routing_api_poll_interval)
            .await
            .context("Routing API unreachable at startup")?;
        tokio::spawn(groups.run(shutdown_rx.clone()));
    }

    let greeting = RouterGreeting {
        id: uuid::Uuid::new_v4().to_string(),
        hosts: vec![config.http_addr.ip().to_string()],
        isolation_segments: config.isolation_segments.clone(),
        routing_table_sharding_mode: config.sharding_mode,
        minimum_register_interval_secs: config.register_interval.as_secs(),
        prune_threshold_secs: config.stale_threshold.as_secs(),
    };
    let subscriber = RegistrySubscriber::new(
        bus.clone() as Arc<dyn MessageBus>,
        Arc::clone(&registry),
        SubscriberConfig {
            backend_tls_enabled: config.backend_tls_enabled,
            sharding_mode: config.sharding_mode,
            isolation_segments: config.isolation_segments.clone(),
            greeting,
        },
    );
    subscriber
        .spawn(shutdown_rx.clone())
        .await
        .context("Failed to subscribe to registration subjects")?;

    let pruner = Pruner::new(
        Arc::clone(&registry),
        PruneConfig {
            interval: config.prune_interval,
            suspend_on_bus_unavailable: config.suspend_pruning_if_bus_unavailable,
        },
        bus.status(),
    );
    tokio::spawn(pruner.run(shutdown_rx.clone()));

    let backend_tls = tls::client_connector(&ClientTlsSettings {
        ca_bundle: config.backend_ca_path.clone(),
        client_cert: config
            .backend_client_cert_path
            .clone()
            .zip(config.backend_client_key_path.clone()),
        skip_verification: config.skip_tls_verification,
    })
    .context("Failed to load backend TLS material")?;
    let connector = Arc::new(BackendConnector::new(
        config.dial_timeout,
        backend_tls,
        PoolConfig {
            max_idle_per_target: config.max_idle_conns_per_backend,
            idle_timeout: config.backend_idle_timeout,
        },
    ));

    let route_services = RouteServiceSigner::new(
        config.route_service_secret.clone(),
        config.route_service_secret_previous.clone(),
        config.route_service_timeout,
    );
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        EndpointSelector::new(SelectorConfig {
            unhealthy_threshold: config.unhealthy_threshold,
            max_conns_per_endpoint: config.backend_max_conns,
        }),
        connector,
        route_services,
        Arc::clone(&drain),
        DispatcherConfig {
            health_check_user_agent: config.health_check_user_agent.clone(),
            affinity_cookie: config.affinity_cookie.clone(),
            max_attempts: config.max_attempts,
            response_timeout: config.response_timeout,
            tunnel_idle_timeout: config.tunnel_idle_timeout,
        },
    ));

    let mut listener_configs = vec![ListenerConfig::new(config.http_addr)];
    if let (Some(addr), Some(cert), Some(key)) =
        (config.tls_addr, &config.tls_cert_path, &config.tls_key_path)
    {
        let acceptor =
            tls::server_acceptor(cert, key).context("Failed to load listener certificate")?;
        listener_configs.push(ListenerConfig::new(addr).with_tls(acceptor));
    }

    for mut listener_config in listener_configs {
        listener_config.max_connections = config.max_connections;
        let bind_addr = listener_config.bind_addr;
        let listener = Listener::bind(listener_config, Arc::clone(&dispatcher))
            .await
            .with_context(|| format!("Failed to bind listener on {bind_addr}"))?;
        tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                error!(error = %e, "Listener error");
            }
        });
    }

    let status_listener = tokio::net::TcpListener::bind(config.status_addr)
        .await
        .with_context(|| format!("Failed to bind status server on {}", config.status_addr))?;
    let admin_state = AdminState::new(
        Arc::clone(&registry),
        Arc::clone(&drain),
        BasicCredentials {
            user: config.status_user.clone(),
            pass: config.status_pass.clone(),
        },
    );
    tokio::spawn(async move {
        if let Err(e) = admin::serve(status_listener, admin_state).await {
            error!(error = %e, "Status server error");
        }
    });

    wait_for_exit(&drain).await?;

    let _ = shutdown_tx.send(true);
    info!("Router stopped");
    Ok(())
}

/// Block until a stop signal arrives or a drain completes.
async fn wait_for_exit(drain: &Arc<DrainCoordinator>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigusr1 =
        signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;
    let mut drain_state = drain.subscribe();

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received; stopping");
                drain.stop();
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("SIGINT received; stopping");
                drain.stop();
                return Ok(());
            }
            _ = sigusr1.recv() => {
                if drain.begin_drain() {
                    let drain = Arc::clone(drain);
                    tokio::spawn(async move {
                        match drain.wait_drained().await {
                            DrainOutcome::Completed => info!("Drain finished cleanly"),
                            DrainOutcome::TimedOut { remaining } => {
                                warn!(remaining, "Drain deadline reached")
                            }
                        }
                    });
                }
            }
            _ = drain::stopped(&mut drain_state) => {
                return Ok(());
            }
        }
    }
}
