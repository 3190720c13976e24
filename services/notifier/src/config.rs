//! Notifier configuration loading.
//!
//! TOML is the sole config source; the CLI may only override the path and
//! the log filter. Default config path: `/etc/healthsync/notifier.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `server.base_url`
//!
//! # Token file format
//! Raw bearer token on a single line; trimmed on read. The token is optional
//! because the backend may rely on a session cookie instead.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::desktop::DesktopMode;
use crate::navigation::Role;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/healthsync/notifier.toml";

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub schema_version: u32,
    /// Bearer token read from `auth.token_file`, if configured.
    pub token: Option<String>,
    pub server: ServerConfig,
    pub realtime: RealtimeConfig,
    pub session: SessionConfig,
    pub desktop: DesktopMode,
    pub control_api: ControlApiConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP(S) base of the REST API, e.g. `https://api.healthsync.example`.
    pub base_url: String,
    /// Path of the raw WebSocket endpoint under `base_url`.
    pub realtime_path: String,
    pub profile_path: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Destination template; `{identity}` is replaced with the user id.
    pub destination: String,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub send_connection_test: bool,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub default_role: Role,
    /// `None` disables periodic snapshot refresh.
    pub refresh_interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ControlApiConfig {
    pub bind: String,
}

impl ServerConfig {
    /// WebSocket URL derived from the HTTP base URL.
    pub fn realtime_url(&self) -> Result<String, ConfigError> {
        let base = self.base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base.to_owned()
        } else {
            return Err(ConfigError::InvalidValue(format!(
                "server.base_url must start with http://, https://, ws:// or wss://, got '{}'",
                self.base_url
            )));
        };
        Ok(format!("{ws_base}{}", self.realtime_path))
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServerConfig>,
    auth: Option<RawAuthConfig>,
    realtime: Option<RawRealtimeConfig>,
    session: Option<RawSessionConfig>,
    desktop: Option<RawDesktopConfig>,
    control_api: Option<RawControlApiConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    base_url: Option<String>,
    realtime_path: Option<String>,
    profile_path: Option<String>,
    request_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    token_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRealtimeConfig {
    destination: Option<String>,
    reconnect_base_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    send_connection_test: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawSessionConfig {
    role: Option<String>,
    refresh_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawDesktopConfig {
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawControlApiConfig {
    bind: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load notifier config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<NotifierConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load notifier config from the default path.
pub fn load_config() -> Result<NotifierConfig, ConfigError> {
    load_config_from_path(Path::new(DEFAULT_CONFIG_PATH))
}

/// Load notifier config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<NotifierConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    // Server
    let raw_server = raw
        .server
        .ok_or_else(|| ConfigError::MissingField("server".to_owned()))?;
    let base_url = raw_server
        .base_url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingField("server.base_url".to_owned()))?;
    let server = ServerConfig {
        base_url: base_url.trim_end_matches('/').to_owned(),
        realtime_path: raw_server
            .realtime_path
            .unwrap_or_else(|| "/ws/websocket".to_owned()),
        profile_path: raw_server
            .profile_path
            .unwrap_or_else(|| "/patients/profile".to_owned()),
        request_timeout: Duration::from_millis(raw_server.request_timeout_ms.unwrap_or(10_000)),
    };
    // Fail early on an unusable scheme.
    server.realtime_url()?;

    // Auth
    let token = match raw.auth.and_then(|a| a.token_file) {
        Some(path) => Some(read_token_file(&path)?),
        None => None,
    };

    // Realtime defaults
    let realtime = match raw.realtime {
        Some(r) => RealtimeConfig {
            destination: r
                .destination
                .unwrap_or_else(|| "/user/queue/notifications".to_owned()),
            reconnect_base_delay: Duration::from_millis(r.reconnect_base_delay_ms.unwrap_or(3000)),
            max_reconnect_attempts: r.max_reconnect_attempts.unwrap_or(5),
            send_connection_test: r.send_connection_test.unwrap_or(true),
        },
        None => RealtimeConfig {
            destination: "/user/queue/notifications".to_owned(),
            reconnect_base_delay: Duration::from_millis(3000),
            max_reconnect_attempts: 5,
            send_connection_test: true,
        },
    };
    if !realtime.destination.starts_with('/') {
        return Err(ConfigError::InvalidValue(format!(
            "realtime.destination must start with '/', got '{}'",
            realtime.destination
        )));
    }

    // Session defaults
    let session = match raw.session {
        Some(s) => SessionConfig {
            default_role: match s.role {
                Some(role) => role.parse().map_err(|_| {
                    ConfigError::InvalidValue(format!(
                        "session.role must be 'patient' or 'doctor', got '{}'",
                        role
                    ))
                })?,
                None => Role::Patient,
            },
            refresh_interval: match s.refresh_interval_secs.unwrap_or(60) {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        },
        None => SessionConfig {
            default_role: Role::Patient,
            refresh_interval: Some(Duration::from_secs(60)),
        },
    };

    // Desktop notifications
    let desktop = match raw.desktop.and_then(|d| d.mode) {
        Some(mode) => mode.parse().map_err(|_| {
            ConfigError::InvalidValue(format!(
                "desktop.mode must be 'disabled', 'log' or 'notify-send', got '{}'",
                mode
            ))
        })?,
        None => DesktopMode::Log,
    };

    let control_api = ControlApiConfig {
        bind: raw
            .control_api
            .and_then(|c| c.bind)
            .unwrap_or_else(|| "127.0.0.1:9190".to_owned()),
    };

    Ok(NotifierConfig {
        schema_version,
        token,
        server,
        realtime,
        session,
        desktop,
        control_api,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Token file reader
// ---------------------------------------------------------------------------

fn read_token_file(path: &str) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading token file '{}': {}", path, e)))?;
    let token = content.trim().to_owned();
    if token.is_empty() {
        return Err(ConfigError::InvalidValue(format!(
            "token file '{}' is empty",
            path
        )));
    }
    Ok(token)
}
