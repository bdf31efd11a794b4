//! Router configuration (env-driven).
//!
//! Every setting comes from a `BEACON_*` variable with a default, except the
//! status server credentials. Parsing goes through [`Config::from_lookup`] so
//! tests can supply variables without touching the process environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use beacon_events::ShardingMode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed.
    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    /// A required variable is unset or empty.
    #[error("missing required setting {0}")]
    Missing(&'static str),

    /// Settings that only make sense together are partially set.
    #[error("incomplete configuration: {0}")]
    Incomplete(&'static str),
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Plain HTTP listener.
    pub http_addr: SocketAddr,

    /// Optional TLS listener; requires `tls_cert_path` and `tls_key_path`.
    pub tls_addr: Option<SocketAddr>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,

    /// Status server (`/routes`, `/healthz`).
    pub status_addr: SocketAddr,
    pub status_user: String,
    pub status_pass: String,

    /// Maximum concurrent client connections per listener.
    pub max_connections: usize,

    pub prune_interval: Duration,
    pub stale_threshold: Duration,
    pub suspend_pruning_if_bus_unavailable: bool,
    /// Advertised to publishers as the expected heartbeat interval.
    pub register_interval: Duration,

    pub dial_timeout: Duration,
    pub response_timeout: Duration,
    pub max_attempts: usize,
    pub unhealthy_threshold: u32,
    /// Per-endpoint request cap; 0 means unlimited.
    pub backend_max_conns: usize,
    pub max_idle_conns_per_backend: usize,
    pub backend_idle_timeout: Duration,
    /// Close upgraded tunnels after this long without traffic.
    pub tunnel_idle_timeout: Option<Duration>,

    pub backend_tls_enabled: bool,
    pub backend_ca_path: Option<PathBuf>,
    pub backend_client_cert_path: Option<PathBuf>,
    pub backend_client_key_path: Option<PathBuf>,
    pub skip_tls_verification: bool,

    pub route_service_secret: Option<String>,
    pub route_service_secret_previous: Option<String>,
    pub route_service_timeout: Duration,

    pub health_check_user_agent: String,
    pub affinity_cookie: String,

    pub drain_timeout: Duration,

    pub isolation_segments: Vec<String>,
    pub sharding_mode: ShardingMode,

    pub routing_api_url: Option<String>,
    pub routing_api_token: Option<String>,
    pub routing_api_poll_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let tls_addr = env.parse::<SocketAddr>("BEACON_TLS_ADDR")?;
        let tls_cert_path = env.string("BEACON_TLS_CERT").map(PathBuf::from);
        let tls_key_path = env.string("BEACON_TLS_KEY").map(PathBuf::from);
        if tls_addr.is_some() && (tls_cert_path.is_none() || tls_key_path.is_none()) {
            return Err(ConfigError::Incomplete(
                "BEACON_TLS_ADDR requires BEACON_TLS_CERT and BEACON_TLS_KEY",
            ));
        }

        let backend_client_cert_path = env.string("BEACON_BACKEND_CLIENT_CERT").map(PathBuf::from);
        let backend_client_key_path = env.string("BEACON_BACKEND_CLIENT_KEY").map(PathBuf::from);
        if backend_client_cert_path.is_some() != backend_client_key_path.is_some() {
            return Err(ConfigError::Incomplete(
                "BEACON_BACKEND_CLIENT_CERT and BEACON_BACKEND_CLIENT_KEY must be set together",
            ));
        }

        let routing_api_enabled = env.flag("BEACON_ROUTING_API_ENABLED")?;
        let routing_api_url = env.string("BEACON_ROUTING_API_URL");
        if routing_api_enabled && routing_api_url.is_none() {
            return Err(ConfigError::Incomplete(
                "BEACON_ROUTING_API_ENABLED requires BEACON_ROUTING_API_URL",
            ));
        }

        let tunnel_idle_secs: u64 = env.parse("BEACON_TUNNEL_IDLE_TIMEOUT_SECS")?.unwrap_or(0);

        Ok(Self {
            http_addr: env
                .parse("BEACON_HTTP_ADDR")?
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080))),
            tls_addr,
            tls_cert_path,
            tls_key_path,
            status_addr: env
                .parse("BEACON_STATUS_ADDR")?
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8082))),
            status_user: env
                .string("BEACON_STATUS_USER")
                .ok_or(ConfigError::Missing("BEACON_STATUS_USER"))?,
            status_pass: env
                .string("BEACON_STATUS_PASS")
                .ok_or(ConfigError::Missing("BEACON_STATUS_PASS"))?,
            max_connections: env
                .parse("BEACON_MAX_CONNECTIONS")?
                .unwrap_or(10_000usize)
                .max(1),

            prune_interval: env.secs("BEACON_PRUNE_INTERVAL_SECS", 30)?.max(Duration::from_secs(1)),
            stale_threshold: env.secs("BEACON_STALE_THRESHOLD_SECS", 120)?.max(Duration::from_secs(1)),
            suspend_pruning_if_bus_unavailable: env
                .flag("BEACON_SUSPEND_PRUNING_IF_BUS_UNAVAILABLE")?,
            register_interval: env.secs("BEACON_REGISTER_INTERVAL_SECS", 20)?,

            dial_timeout: env
                .millis("BEACON_DIAL_TIMEOUT_MS", 5_000)?
                .max(Duration::from_millis(10)),
            response_timeout: env
                .secs("BEACON_RESPONSE_TIMEOUT_SECS", 60)?
                .max(Duration::from_secs(1)),
            max_attempts: env
                .parse("BEACON_MAX_ATTEMPTS")?
                .unwrap_or(3usize)
                .clamp(1, 10),
            unhealthy_threshold: env.parse("BEACON_UNHEALTHY_THRESHOLD")?.unwrap_or(3u32),
            backend_max_conns: env.parse("BEACON_BACKEND_MAX_CONNS")?.unwrap_or(0usize),
            max_idle_conns_per_backend: env
                .parse("BEACON_MAX_IDLE_CONNS_PER_BACKEND")?
                .unwrap_or(32usize),
            backend_idle_timeout: env.secs("BEACON_BACKEND_IDLE_TIMEOUT_SECS", 90)?,
            tunnel_idle_timeout: (tunnel_idle_secs > 0)
                .then(|| Duration::from_secs(tunnel_idle_secs)),

            backend_tls_enabled: env.flag("BEACON_BACKEND_TLS_ENABLED")?,
            backend_ca_path: env.string("BEACON_BACKEND_CA").map(PathBuf::from),
            backend_client_cert_path,
            backend_client_key_path,
            skip_tls_verification: env.flag("BEACON_SKIP_TLS_VERIFICATION")?,

            route_service_secret: env.string("BEACON_ROUTE_SERVICE_SECRET"),
            route_service_secret_previous: env.string("BEACON_ROUTE_SERVICE_SECRET_PREVIOUS"),
            route_service_timeout: env.secs("BEACON_ROUTE_SERVICE_TIMEOUT_SECS", 60)?,

            health_check_user_agent: env
                .string("BEACON_HEALTH_CHECK_USER_AGENT")
                .unwrap_or_else(|| "HTTP-Monitor/1.1".to_string()),
            affinity_cookie: env
                .string("BEACON_AFFINITY_COOKIE")
                .unwrap_or_else(|| "__beacon_instance_id".to_string()),

            drain_timeout: env.secs("BEACON_DRAIN_TIMEOUT_SECS", 30)?,

            isolation_segments: env
                .string("BEACON_ISOLATION_SEGMENTS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            sharding_mode: env.parse("BEACON_SHARDING_MODE")?.unwrap_or_default(),

            routing_api_url: routing_api_url.filter(|_| routing_api_enabled),
            routing_api_token: env.string("BEACON_ROUTING_API_TOKEN"),
            routing_api_poll_interval: env
                .secs("BEACON_ROUTING_API_POLL_INTERVAL_SECS", 30)?
                .max(Duration::from_secs(1)),

            log_level: env
                .string("BEACON_LOG_LEVEL")
                .unwrap_or_else(|| "info".to_string()),
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, var: &'static str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(var)
            .map(|value| {
                value.parse::<T>().map_err(|e| ConfigError::Invalid {
                    var,
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn flag(&self, var: &'static str) -> Result<bool, ConfigError> {
        match self.string(var) {
            None => Ok(false),
            Some(value) => match value.to_lowercase().as_str() {
                "1" | "true" | "yes" => Ok(true),
                "0" | "false" | "no" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    var,
                    value,
                    reason: "expected true or false".to_string(),
                }),
            },
        }
    }

    fn secs(&self, var: &'static str, default: u64) -> Result<Duration, ConfigError> {
        Ok(Duration::from_secs(self.parse(var)?.unwrap_or(default)))
    }

    fn millis(&self, var: &'static str, default: u64) -> Result<Duration, ConfigError> {
        Ok(Duration::from_millis(self.parse(var)?.unwrap_or(default)))
    }
}
