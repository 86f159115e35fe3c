use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Secrets that ship in sample files and must never reach a running server.
const PLACEHOLDER_SECRETS: &[&str] = &["dev-secret-change-me", "change-me", "changeme", "secret"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("MEDIA_JWT_SECRET is a placeholder value; set a real secret")]
    PlaceholderSecret,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub redis_url: String,
    pub jwt_secret: String,
    /// Consumer name inside every projector group. A stable name replays its
    /// own pending deliveries at startup. Deliveries left by a name that never
    /// returns are claimed once idle for `claim_idle`.
    pub worker_name: String,
    pub claim_idle: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub publish_timeout: Duration,
    pub stream_max_len: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let host = var("MEDIA_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parse(&var, "MEDIA_PORT", 3000)?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .map_err(|_| ConfigError::Invalid {
                name: "MEDIA_HOST",
                value: host.clone(),
            })?;

        let jwt_secret = var("MEDIA_JWT_SECRET").ok_or(ConfigError::Missing("MEDIA_JWT_SECRET"))?;
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            return Err(ConfigError::PlaceholderSecret);
        }

        Ok(Self {
            addr,
            redis_url: var("MEDIA_REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
            jwt_secret,
            worker_name: var("MEDIA_WORKER_NAME")
                .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4())),
            claim_idle: Duration::from_secs(parse(&var, "MEDIA_CLAIM_IDLE_SECS", 30)?),
            max_retries: parse(&var, "MEDIA_MAX_RETRIES", 3)?,
            retry_base: Duration::from_millis(parse(&var, "MEDIA_RETRY_BASE_MS", 1000)?),
            publish_timeout: Duration::from_secs(parse(&var, "MEDIA_PUBLISH_TIMEOUT_SECS", 30)?),
            stream_max_len: parse(&var, "MEDIA_STREAM_MAX_LEN", 100_000)?,
        })
    }
}

fn parse<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match var(name) {
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(parsed),
            Err(_) => Err(ConfigError::Invalid { name, value }),
        },
        None => Ok(default),
    }
}
