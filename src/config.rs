//! Widget configuration parsed from environment variables.
//!
//! Embedders normally build [`WidgetConfig`] in code; `from_env` serves
//! deployments that configure the widget host through the process
//! environment. The CLI reads the same variables as flag fallbacks.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:3000/api";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Where and how to reach the widget backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub api_base: String,
    pub api_key: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl ApiConfig {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

/// Page the widget is embedded in, reported when a session is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageContext {
    pub domain: String,
    pub origin: String,
    pub referrer: String,
}

impl PageContext {
    /// Build a context from an origin, deriving `domain` from its host.
    pub fn from_origin(origin: impl Into<String>, referrer: impl Into<String>) -> Self {
        let origin = origin.into();
        let domain = reqwest::Url::parse(&origin)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
            .unwrap_or_default();
        Self { domain, origin, referrer: referrer.into() }
    }
}

/// Which visitor fields must be collected before chatting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrechatRequirements {
    pub collect_name: bool,
    pub collect_email: bool,
}

/// Delivery tuning for the realtime transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    pub poll_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            reconnect_base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetConfig {
    pub api: ApiConfig,
    pub page: PageContext,
    pub prechat: PrechatRequirements,
    /// Business user to talk to directly, skipping the search view.
    pub target_user_id: Option<String>,
    pub transport: TransportConfig,
    /// Directory for persisted visitor state; in-memory when `None`.
    pub storage_dir: Option<PathBuf>,
}

impl WidgetConfig {
    pub fn new(api: ApiConfig) -> Self {
        let page = PageContext::from_origin(origin_of(&api.api_base), "");
        Self {
            api,
            page,
            prechat: PrechatRequirements::default(),
            target_user_id: None,
            transport: TransportConfig::default(),
            storage_dir: None,
        }
    }

    /// Build typed widget config from environment variables.
    ///
    /// Required:
    /// - `WIDGET_API_KEY`
    ///
    /// Optional:
    /// - `WIDGET_API_BASE`: default `http://127.0.0.1:3000/api`
    /// - `WIDGET_ORIGIN` / `WIDGET_REFERRER`: page context sent on session creation
    /// - `WIDGET_COLLECT_NAME` / `WIDGET_COLLECT_EMAIL`: pre-chat requirements
    /// - `WIDGET_TARGET_USER_ID`: skip search and open conversations directly
    /// - `WIDGET_POLL_INTERVAL_MS`: default 3000
    /// - `WIDGET_RECONNECT_BASE_MS`: default 1000
    /// - `WIDGET_MAX_RECONNECT_ATTEMPTS`: default 5
    /// - `WIDGET_REQUEST_TIMEOUT_SECS` / `WIDGET_CONNECT_TIMEOUT_SECS`: default 30 / 10
    /// - `WIDGET_STORAGE_DIR`: persist visitor state under this directory
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] without an API key and
    /// [`ConfigError::Invalid`] for unparsable booleans.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("WIDGET_API_KEY").map_err(|_| ConfigError::Missing("WIDGET_API_KEY"))?;
        let api_base = std::env::var("WIDGET_API_BASE")
            .unwrap_or_else(|_| DEFAULT_API_BASE.to_owned())
            .trim_end_matches('/')
            .to_owned();
        let api = ApiConfig {
            api_base,
            api_key,
            request_timeout_secs: env_parse("WIDGET_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_timeout_secs: env_parse("WIDGET_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
        };

        let origin = std::env::var("WIDGET_ORIGIN").unwrap_or_else(|_| origin_of(&api.api_base));
        let referrer = std::env::var("WIDGET_REFERRER").unwrap_or_default();

        let prechat = PrechatRequirements {
            collect_name: env_flag("WIDGET_COLLECT_NAME")?,
            collect_email: env_flag("WIDGET_COLLECT_EMAIL")?,
        };

        let transport = TransportConfig {
            poll_interval: Duration::from_millis(env_parse("WIDGET_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)),
            reconnect_base_delay: Duration::from_millis(env_parse(
                "WIDGET_RECONNECT_BASE_MS",
                DEFAULT_RECONNECT_BASE_MS,
            )),
            max_reconnect_attempts: env_parse("WIDGET_MAX_RECONNECT_ATTEMPTS", DEFAULT_MAX_RECONNECT_ATTEMPTS),
        };

        Ok(Self {
            api,
            page: PageContext::from_origin(origin, referrer),
            prechat,
            target_user_id: std::env::var("WIDGET_TARGET_USER_ID").ok().filter(|v| !v.is_empty()),
            transport,
            storage_dir: std::env::var_os("WIDGET_STORAGE_DIR").map(PathBuf::from),
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &'static str) -> Result<bool, ConfigError> {
    match std::env::var(key).ok().as_deref() {
        None | Some("" | "0" | "false" | "no") => Ok(false),
        Some("1" | "true" | "yes") => Ok(true),
        Some(other) => Err(ConfigError::Invalid { var: key, value: other.to_owned() }),
    }
}

/// `scheme://host[:port]` of a URL, or the input when it does not parse.
fn origin_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .map(|parsed| parsed.origin().ascii_serialization())
        .unwrap_or_else(|_| url.to_owned())
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
