//! Client configuration from environment variables.

use std::time::Duration;

use url::Url;

pub const SOCKET_URL_ENV: &str = "LMS_SOCKET_URL";
pub const SOCKET_PATH_ENV: &str = "LMS_SOCKET_PATH";
pub const API_URL_ENV: &str = "LMS_API_URL";
pub const RECONNECT_ATTEMPTS_ENV: &str = "LMS_RECONNECT_ATTEMPTS";
pub const RECONNECT_DELAY_ENV: &str = "LMS_RECONNECT_DELAY_MS";
pub const RECONNECT_DELAY_MAX_ENV: &str = "LMS_RECONNECT_DELAY_MAX_MS";
pub const CONNECT_TIMEOUT_ENV: &str = "LMS_CONNECT_TIMEOUT_MS";

pub const DEFAULT_SOCKET_URL: &str = "http://localhost:5000";
pub const DEFAULT_SOCKET_PATH: &str = "/ws";

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub enabled: bool,
    /// Maximum number of reconnect attempts after the initial one
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u32,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u32,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for a given attempt number (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> u32 {
        let delay = self.initial_delay_ms as f32 * self.backoff_multiplier.powi(attempt as i32);
        (delay as u32).min(self.max_delay_ms)
    }

    /// Whether another attempt may follow `attempt` reconnect attempts.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.enabled && attempt < self.max_attempts
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Realtime backend, http(s) or ws(s)
    pub endpoint: String,
    pub socket_path: String,
    /// Base URL of the REST API used for the session check
    pub api_url: String,
    pub reconnect: ReconnectConfig,
    pub connect_timeout: Duration,
    /// Emits queued while (re)connecting; overflow is dropped
    pub max_buffered_emits: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_SOCKET_URL.to_string(),
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            api_url: DEFAULT_SOCKET_URL.to_string(),
            reconnect: ReconnectConfig::default(),
            connect_timeout: Duration::from_millis(20_000),
            max_buffered_emits: 256,
        }
    }
}

impl RealtimeConfig {
    /// Read configuration from the process environment.
    ///
    /// Environment variables:
    /// - `LMS_SOCKET_URL`: realtime backend (default: "http://localhost:5000")
    /// - `LMS_SOCKET_PATH`: socket path on that host (default: "/ws")
    /// - `LMS_API_URL`: REST API base (default: the socket URL)
    /// - `LMS_RECONNECT_ATTEMPTS`, `LMS_RECONNECT_DELAY_MS`,
    ///   `LMS_RECONNECT_DELAY_MAX_MS`, `LMS_CONNECT_TIMEOUT_MS`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str| non_empty(key).and_then(|v| v.trim().parse::<u32>().ok());

        let endpoint = non_empty(SOCKET_URL_ENV).unwrap_or(defaults.endpoint);
        let api_url = non_empty(API_URL_ENV).unwrap_or_else(|| endpoint.clone());

        let reconnect = ReconnectConfig {
            max_attempts: number(RECONNECT_ATTEMPTS_ENV)
                .unwrap_or(defaults.reconnect.max_attempts),
            initial_delay_ms: number(RECONNECT_DELAY_ENV)
                .unwrap_or(defaults.reconnect.initial_delay_ms),
            max_delay_ms: number(RECONNECT_DELAY_MAX_ENV)
                .unwrap_or(defaults.reconnect.max_delay_ms),
            ..defaults.reconnect
        };

        Self {
            endpoint,
            socket_path: non_empty(SOCKET_PATH_ENV).unwrap_or(defaults.socket_path),
            api_url,
            reconnect,
            connect_timeout: number(CONNECT_TIMEOUT_ENV)
                .map(|ms| Duration::from_millis(ms as u64))
                .unwrap_or(defaults.connect_timeout),
            max_buffered_emits: defaults.max_buffered_emits,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Build the WebSocket URL, optionally carrying the session token.
    pub fn socket_url(&self, token: Option<&str>) -> Result<Url, url::ParseError> {
        let base = http_to_ws(self.endpoint.trim().trim_end_matches('/'));
        let path = self.socket_path.trim_start_matches('/');
        let mut url = Url::parse(&format!("{base}/{path}"))?;
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }
}

/// Convert HTTP/HTTPS URL to WS/WSS. Bare hosts get `ws://`.
fn http_to_ws(url: &str) -> String {
    if url.starts_with("https://") {
        url.replacen("https://", "wss://", 1)
    } else if url.starts_with("http://") {
        url.replacen("http://", "ws://", 1)
    } else if url.starts_with("ws://") || url.starts_with("wss://") {
        url.to_string()
    } else {
        format!("ws://{url}")
    }
}
