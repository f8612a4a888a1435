use std::time::Duration;

use url::Url;
use uuid::Uuid;

use crate::channel::ReconnectPolicy;
use crate::error::ConfigError;

pub const DEFAULT_API_BASE: &str = "http://localhost:8000";
pub const DEFAULT_API_PREFIX: &str = "/api/v1";
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BANNER_DECAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct EditorConfig {
    /// Origin of the REST API, e.g. `https://ems.example.com`.
    pub api_base: String,
    pub api_prefix: String,
    pub tenant_id: Option<Uuid>,
    pub token: Option<String>,
    pub ack_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// How long a success or failure banner stays up before returning to idle.
    pub banner_decay: Duration,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.into(),
            api_prefix: DEFAULT_API_PREFIX.into(),
            tenant_id: None,
            token: None,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            banner_decay: DEFAULT_BANNER_DECAY,
        }
    }
}

impl EditorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let api_base = std::env::var("SETPOINT_API_BASE").unwrap_or(defaults.api_base);
        let api_prefix = std::env::var("SETPOINT_API_PREFIX").unwrap_or(defaults.api_prefix);
        let tenant_id = match std::env::var("SETPOINT_TENANT_ID") {
            Ok(raw) if !raw.trim().is_empty() => {
                Some(Uuid::parse_str(raw.trim()).map_err(|_| ConfigError::Invalid {
                    name: "SETPOINT_TENANT_ID",
                    value: raw.clone(),
                    expected: "uuid",
                })?)
            }
            _ => None,
        };
        let token = std::env::var("SETPOINT_TOKEN").ok().filter(|t| !t.is_empty());
        let ack_timeout = env_millis("SETPOINT_ACK_TIMEOUT_MS", defaults.ack_timeout)?;
        let reconnect = ReconnectPolicy {
            base: env_millis("SETPOINT_RECONNECT_BASE_MS", defaults.reconnect.base)?,
            max: env_millis("SETPOINT_RECONNECT_MAX_MS", defaults.reconnect.max)?,
            jitter: env_millis("SETPOINT_RECONNECT_JITTER_MS", defaults.reconnect.jitter)?,
        };
        let banner_decay = env_millis("SETPOINT_BANNER_DECAY_MS", defaults.banner_decay)?;
        Ok(Self {
            api_base,
            api_prefix,
            tenant_id,
            token,
            ack_timeout,
            reconnect,
            banner_decay,
        })
    }

    /// Base for REST paths: origin plus version prefix, without a trailing slash.
    pub fn api_url(&self) -> String {
        format!(
            "{}{}",
            self.api_base.trim_end_matches('/'),
            normalize_prefix(&self.api_prefix)
        )
    }

    pub fn tenant(&self) -> Result<Uuid, ConfigError> {
        self.tenant_id.ok_or(ConfigError::MissingTenant)
    }

    pub fn channel_url(&self, tenant: Uuid) -> Result<Url, ConfigError> {
        channel_url(&self.api_base, &self.api_prefix, tenant)
    }
}

/// Derives the tenant channel endpoint from the REST origin, upgrading
/// `http` to `ws` and `https` to `wss`.
pub fn channel_url(origin: &str, prefix: &str, tenant: Uuid) -> Result<Url, ConfigError> {
    let mut url = Url::parse(origin)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ConfigError::Scheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| ConfigError::Scheme(scheme.to_string()))?;
    let path = format!(
        "{}{}/ws/{}",
        url.path().trim_end_matches('/'),
        normalize_prefix(prefix),
        tenant
    );
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

fn env_millis(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::Invalid {
                name,
                value: raw,
                expected: "duration in milliseconds",
            }),
        Err(_) => Ok(default),
    }
}
