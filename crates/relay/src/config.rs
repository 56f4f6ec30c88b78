// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The Postgres pool still reads its own sizing variables in
// `db::pool`.

use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_REDIS_PREFIX: &str = "tablesync:ws";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Which fan-out backend the collaboration service builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubBackend {
    Local,
    Redis { url: String, prefix: String },
}

impl PubSubBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Redis { .. } => "redis",
        }
    }
}

/// Submission pipeline tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitConfig {
    /// CAS attempts before giving up with `ConflictExhausted`.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubled for each later one.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Caller-side deadline for one `submit`.
    pub timeout: Duration,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(500),
            timeout: Duration::from_millis(10_000),
        }
    }
}

/// WebSocket session tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeat intervals without a pong before closing.
    pub max_missed_pongs: u32,
    pub outbound_queue_capacity: usize,
    pub max_connections: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            max_missed_pongs: 2,
            outbound_queue_capacity: 256,
            max_connections: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceConfig {
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(300), sweep_interval: Duration::from_secs(30) }
    }
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string. The in-memory store is used when unset.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `tablesync_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    pub pubsub: PubSubBackend,
    pub submit: SubmitConfig,
    pub session: SessionConfig,
    pub presence: PresenceConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `TABLESYNC_RELAY_HOST` | `0.0.0.0` |
    /// | `TABLESYNC_RELAY_PORT` | `8080` |
    /// | `TABLESYNC_RELAY_DATABASE_URL` | *(none; in-memory store)* |
    /// | `TABLESYNC_RELAY_CORS_ORIGINS` | *(none; cors.rs uses dev defaults)* |
    /// | `TABLESYNC_RELAY_LOG_FILTER` | `info` |
    /// | `TABLESYNC_RELAY_LOG_FORMAT` | `text` |
    /// | `TABLESYNC_RELAY_PUBSUB` | `local` |
    /// | `TABLESYNC_RELAY_REDIS_URL` | `redis://127.0.0.1:6379` |
    /// | `TABLESYNC_RELAY_REDIS_PREFIX` | `tablesync:ws` |
    /// | `TABLESYNC_RELAY_SUBMIT_MAX_ATTEMPTS` | `5` |
    /// | `TABLESYNC_RELAY_SUBMIT_BACKOFF_MS` | `10` |
    /// | `TABLESYNC_RELAY_SUBMIT_BACKOFF_MAX_MS` | `500` |
    /// | `TABLESYNC_RELAY_SUBMIT_TIMEOUT_MS` | `10000` |
    /// | `TABLESYNC_RELAY_HEARTBEAT_INTERVAL_SECS` | `30` |
    /// | `TABLESYNC_RELAY_MAX_MISSED_PONGS` | `2` |
    /// | `TABLESYNC_RELAY_OUTBOUND_QUEUE` | `256` |
    /// | `TABLESYNC_RELAY_MAX_CONNECTIONS` | `1000` |
    /// | `TABLESYNC_RELAY_PRESENCE_TTL_SECS` | `300` |
    /// | `TABLESYNC_RELAY_PRESENCE_SWEEP_SECS` | `30` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let parsed = |key: &str| env(key).ok().and_then(|v| v.trim().parse::<u64>().ok());
        let positive = |key: &str| parsed(key).filter(|v| *v > 0);

        let host = env("TABLESYNC_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("TABLESYNC_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url = env("TABLESYNC_RELAY_DATABASE_URL").ok().filter(|v| !v.trim().is_empty());
        let cors_origins = env("TABLESYNC_RELAY_CORS_ORIGINS").ok();
        let log_filter = env("TABLESYNC_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("TABLESYNC_RELAY_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let pubsub = match env("TABLESYNC_RELAY_PUBSUB").as_deref() {
            Ok("redis") => PubSubBackend::Redis {
                url: env("TABLESYNC_RELAY_REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.into()),
                prefix: env("TABLESYNC_RELAY_REDIS_PREFIX")
                    .unwrap_or_else(|_| DEFAULT_REDIS_PREFIX.into()),
            },
            _ => PubSubBackend::Local,
        };

        let submit_defaults = SubmitConfig::default();
        let submit = SubmitConfig {
            max_attempts: positive("TABLESYNC_RELAY_SUBMIT_MAX_ATTEMPTS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(submit_defaults.max_attempts),
            backoff_base: parsed("TABLESYNC_RELAY_SUBMIT_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(submit_defaults.backoff_base),
            backoff_max: parsed("TABLESYNC_RELAY_SUBMIT_BACKOFF_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(submit_defaults.backoff_max),
            timeout: positive("TABLESYNC_RELAY_SUBMIT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(submit_defaults.timeout),
        };

        let session_defaults = SessionConfig::default();
        let session = SessionConfig {
            heartbeat_interval: positive("TABLESYNC_RELAY_HEARTBEAT_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(session_defaults.heartbeat_interval),
            max_missed_pongs: positive("TABLESYNC_RELAY_MAX_MISSED_PONGS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(session_defaults.max_missed_pongs),
            outbound_queue_capacity: positive("TABLESYNC_RELAY_OUTBOUND_QUEUE")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(session_defaults.outbound_queue_capacity),
            max_connections: positive("TABLESYNC_RELAY_MAX_CONNECTIONS")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(session_defaults.max_connections),
        };

        let presence_defaults = PresenceConfig::default();
        let presence = PresenceConfig {
            ttl: positive("TABLESYNC_RELAY_PRESENCE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(presence_defaults.ttl),
            sweep_interval: positive("TABLESYNC_RELAY_PRESENCE_SWEEP_SECS")
                .map(Duration::from_secs)
                .unwrap_or(presence_defaults.sweep_interval),
        };

        Self {
            listen_addr,
            database_url,
            cors_origins,
            log_filter,
            log_format,
            pubsub,
            submit,
            session,
            presence,
        }
    }
}
