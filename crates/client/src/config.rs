// Client configuration file.
//
// Location: `~/.dentika/config.toml`. Every field has a default, so a
// missing file or a partial file is valid.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Root directory for Dentika client state: `~/.dentika/`.
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".dentika"))
}

/// Path to the config file: `~/.dentika/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

// ── Client config ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ClientConfig {
    pub api: ApiConfig,
    pub realtime: RealtimeConfig,
    pub notifications: NotificationsConfig,
    pub health: HealthConfig,
}

impl ClientConfig {
    /// Load from `~/.dentika/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// REST API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the practice-management server (e.g. `https://app.example.com`).
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { base_url: "http://localhost:3000".into(), request_timeout_secs: 30 }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Realtime bus settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Well-known bus endpoint used against non-local API hosts.
    pub url: String,
    /// Port used on the loopback host during local development.
    pub dev_port: u16,
    /// First token of every subject.
    pub subject_prefix: String,
    pub heartbeat_interval_secs: u64,
    pub handshake_timeout_secs: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: "wss://nats.dentika.app:9222".into(),
            dev_port: 9222,
            subject_prefix: "dentika".into(),
            heartbeat_interval_secs: 30,
            handshake_timeout_secs: 10,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl RealtimeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Pick the bus endpoint for a given API base URL.
    ///
    /// A loopback API host means local development, so the bus is expected
    /// on the loopback host as well.
    pub fn resolve_endpoint(&self, api_base_url: &str) -> String {
        let host = Url::parse(api_base_url).ok().and_then(|u| u.host_str().map(str::to_string));
        if is_loopback_host(host.as_deref()) {
            format!("wss://localhost:{}", self.dev_port)
        } else {
            self.url.clone()
        }
    }
}

/// Reconnection schedule. `max_attempts = -1` retries forever.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: i64,
    pub jitter_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { base_delay_ms: 1_000, max_delay_ms: 30_000, max_attempts: -1, jitter_ms: 0 }
    }
}

/// Notification store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationsConfig {
    pub max_entries: usize,
    pub toast_dismiss_ms: u64,
    pub dedup_window_ms: u64,
    pub page_size: u32,
    pub recent_count: usize,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            toast_dismiss_ms: 5_000,
            dedup_window_ms: 1_000,
            page_size: 20,
            recent_count: 10,
        }
    }
}

impl NotificationsConfig {
    pub fn toast_dismiss_delay(&self) -> Duration {
        Duration::from_millis(self.toast_dismiss_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }
}

/// Server health probing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub probe_path: String,
    pub probe_timeout_secs: u64,
    pub probe_interval_secs: u64,
    /// Failures before the UI should show the offline overlay.
    pub max_retries: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_path: "/api/auth/health".into(),
            probe_timeout_secs: 5,
            probe_interval_secs: 30,
            max_retries: 3,
        }
    }
}

impl HealthConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

pub(crate) fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|addr| addr.is_loopback())
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
