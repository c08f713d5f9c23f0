use std::time::Duration;

use serde::Deserialize;

use syncparty_core::net::protocol::MAX_MESSAGE_SIZE;
use syncparty_core::registry::{DEFAULT_GRID_SIZE, MAX_GRID_SIZE};
use syncparty_core::room::RoomSettings;
use syncparty_core::transport::{DEFAULT_LATENCY_MS, DEFAULT_MAX_LATENCY_MS, DEFAULT_SAFETY_MARGIN_MS};

/// Default config file, looked up in the working directory.
pub const CONFIG_FILE: &str = "syncparty.toml";

/// Top-level server configuration, loaded from `syncparty.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub limits: LimitsConfig,
    pub rooms: RoomsConfig,
    pub sync: SyncConfig,
    pub auth: AuthFileConfig,
    pub records: RecordsConfig,
}

/// Infrastructure limits (connection caps, buffer sizes, rate limits).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_ws_connections: usize,
    /// Maximum concurrent WebSocket connections per IP address.
    pub max_ws_per_ip: usize,
    /// Outbound frames buffered per connection before the peer counts as slow.
    pub connection_buffer: usize,
    pub ws_rate_limit_per_sec: f64,
    pub ws_rate_limit_burst: f64,
    pub max_message_size: usize,
    pub max_devices_per_room: usize,
    pub room_queue_capacity: usize,
    pub max_rooms: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_ws_connections: 1000,
            max_ws_per_ip: 20,
            connection_buffer: 64,
            ws_rate_limit_per_sec: 20.0,
            ws_rate_limit_burst: 40.0,
            max_message_size: MAX_MESSAGE_SIZE,
            max_devices_per_room: 32,
            room_queue_capacity: 256,
            max_rooms: 10_000,
        }
    }
}

/// Room lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoomsConfig {
    /// How long an empty room lingers before it is retired.
    pub grace_period_ms: u64,
    /// How long a disconnected device keeps its cell.
    pub disconnected_device_ttl_ms: u64,
    /// How long a retired code answers `RoomExpired` instead of `RoomNotFound`.
    pub expired_code_ttl_ms: u64,
    pub reap_interval_ms: u64,
    pub default_grid_size: u32,
    pub max_grid_size: u32,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 60_000,
            disconnected_device_ttl_ms: 300_000,
            expired_code_ttl_ms: 3_600_000,
            reap_interval_ms: 5_000,
            default_grid_size: DEFAULT_GRID_SIZE,
            max_grid_size: 16,
        }
    }
}

/// Playback synchronization tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub safety_margin_ms: u64,
    pub default_latency_ms: u64,
    pub max_latency_ms: u64,
    pub ping_interval_ms: u64,
    pub liveness_timeout_ms: u64,
    /// Weight of a new round-trip sample, in `(0, 1]`.
    pub latency_smoothing: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            safety_margin_ms: DEFAULT_SAFETY_MARGIN_MS,
            default_latency_ms: DEFAULT_LATENCY_MS,
            max_latency_ms: DEFAULT_MAX_LATENCY_MS,
            ping_interval_ms: 5_000,
            liveness_timeout_ms: 30_000,
            latency_smoothing: 0.25,
        }
    }
}

/// Auth section of the config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthFileConfig {
    /// Bearer token for the operator API. None = auth disabled.
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordsBackend {
    #[default]
    Memory,
    Http,
}

/// Where party records come from.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordsConfig {
    pub backend: RecordsBackend,
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub request_timeout_ms: u64,
    /// Parties known to the in-memory backend at startup.
    pub parties: Vec<PartySeed>,
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            backend: RecordsBackend::Memory,
            base_url: None,
            token: None,
            request_timeout_ms: 5_000,
            parties: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartySeed {
    pub code: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub grid_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

fn require(ok: bool, what: &str) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError(what.to_string()))
    }
}

impl ServerConfig {
    /// Default listen address used when neither file nor env sets one.
    pub const DEFAULT_LISTEN_ADDR: &'static str = "0.0.0.0:8080";

    /// Check invariants that `Deserialize` cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require(
            self.listen_addr().parse::<std::net::SocketAddr>().is_ok(),
            &format!("listen_addr {:?} is not a socket address", self.listen_addr()),
        )?;

        let l = &self.limits;
        require(l.max_ws_connections > 0, "limits.max_ws_connections must be > 0")?;
        require(l.max_ws_per_ip > 0, "limits.max_ws_per_ip must be > 0")?;
        require(l.connection_buffer > 0, "limits.connection_buffer must be > 0")?;
        require(
            l.ws_rate_limit_per_sec > 0.0,
            "limits.ws_rate_limit_per_sec must be > 0",
        )?;
        require(
            l.ws_rate_limit_burst >= 1.0,
            "limits.ws_rate_limit_burst must be >= 1",
        )?;
        require(
            (1..=MAX_MESSAGE_SIZE).contains(&l.max_message_size),
            &format!("limits.max_message_size must be between 1 and {MAX_MESSAGE_SIZE}"),
        )?;
        require(l.max_devices_per_room > 0, "limits.max_devices_per_room must be > 0")?;
        require(l.room_queue_capacity > 0, "limits.room_queue_capacity must be > 0")?;
        require(l.max_rooms > 0, "limits.max_rooms must be > 0")?;

        let r = &self.rooms;
        require(r.reap_interval_ms > 0, "rooms.reap_interval_ms must be > 0")?;
        require(
            (1..=MAX_GRID_SIZE).contains(&r.max_grid_size),
            &format!("rooms.max_grid_size must be between 1 and {MAX_GRID_SIZE}"),
        )?;
        require(
            (1..=r.max_grid_size).contains(&r.default_grid_size),
            "rooms.default_grid_size must be between 1 and rooms.max_grid_size",
        )?;

        let s = &self.sync;
        require(s.ping_interval_ms > 0, "sync.ping_interval_ms must be > 0")?;
        require(
            s.liveness_timeout_ms > s.ping_interval_ms,
            "sync.liveness_timeout_ms must exceed sync.ping_interval_ms",
        )?;
        require(
            s.latency_smoothing > 0.0 && s.latency_smoothing <= 1.0,
            "sync.latency_smoothing must be in (0, 1]",
        )?;
        require(
            s.default_latency_ms <= s.max_latency_ms,
            "sync.default_latency_ms must not exceed sync.max_latency_ms",
        )?;

        if self.records.backend == RecordsBackend::Http {
            require(
                self.records
                    .base_url
                    .as_deref()
                    .is_some_and(|u| u.starts_with("http://") || u.starts_with("https://")),
                "records.base_url must be an http(s) URL when records.backend = \"http\"",
            )?;
        }
        for party in &self.records.parties {
            require(
                syncparty_core::room::normalize_party_code(&party.code).is_some(),
                &format!("records.parties code {:?} is not a valid party code", party.code),
            )?;
        }

        if self.auth.bearer_token.is_some() {
            tracing::warn!(
                "bearer_token is set in config file, prefer SYNCPARTY_API_TOKEN in production"
            );
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> &str {
        if self.listen_addr.is_empty() {
            Self::DEFAULT_LISTEN_ADDR
        } else {
            &self.listen_addr
        }
    }

    /// Tunables handed to every new party room.
    pub fn room_settings(&self) -> RoomSettings {
        RoomSettings {
            grid_size: self.rooms.default_grid_size,
            max_grid_size: self.rooms.max_grid_size,
            max_devices: self.limits.max_devices_per_room,
            safety_margin_ms: self.sync.safety_margin_ms,
            max_latency_ms: self.sync.max_latency_ms,
            default_latency_ms: self.sync.default_latency_ms,
            latency_smoothing: self.sync.latency_smoothing,
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.sync.ping_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.liveness_timeout_ms)
    }

    /// Load config from `syncparty.toml` if it exists, then apply env var overrides.
    pub fn load() -> Self {
        let path = std::env::var("SYNCPARTY_CONFIG").unwrap_or_else(|_| CONFIG_FILE.to_string());
        let mut config = match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<ServerConfig>(&content) {
                Ok(cfg) => {
                    tracing::info!(path, "Loaded configuration");
                    cfg
                },
                Err(e) => {
                    tracing::warn!(path, error = %e, "Failed to parse config, using defaults");
                    ServerConfig::default()
                },
            },
            Err(_) => {
                tracing::info!(path, "No config file found, using defaults");
                ServerConfig::default()
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Apply `SYNCPARTY_*` overrides from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(addr) = get("SYNCPARTY_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(token) = get("SYNCPARTY_API_TOKEN") {
            self.auth.bearer_token = Some(token);
        }
        if let Some(backend) = get("SYNCPARTY_RECORDS_BACKEND") {
            match backend.as_str() {
                "memory" => self.records.backend = RecordsBackend::Memory,
                "http" => self.records.backend = RecordsBackend::Http,
                other => tracing::warn!(value = other, "Ignoring unknown SYNCPARTY_RECORDS_BACKEND"),
            }
        }
        if let Some(url) = get("SYNCPARTY_RECORDS_URL") {
            self.records.base_url = Some(url);
        }
        if let Some(token) = get("SYNCPARTY_RECORDS_TOKEN") {
            self.records.token = Some(token);
        }

        if let Some(val) = get("SYNCPARTY_MAX_WS_CONNECTIONS")
            && let Ok(n) = val.parse::<usize>()
        {
            self.limits.max_ws_connections = n;
        }
        if let Some(val) = get("SYNCPARTY_WS_RATE_LIMIT")
            && let Ok(n) = val.parse::<f64>()
        {
            self.limits.ws_rate_limit_per_sec = n;
        }
        if let Some(val) = get("SYNCPARTY_GRACE_PERIOD_MS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.rooms.grace_period_ms = n;
        }
        if let Some(val) = get("SYNCPARTY_SAFETY_MARGIN_MS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.sync.safety_margin_ms = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:8080");
        assert!(cfg.auth.bearer_token.is_none());
        assert_eq!(cfg.records.backend, RecordsBackend::Memory);
        cfg.validate().unwrap();
    }

    #[test]
    fn parse_full_toml() {
        let toml_str = r#"
listen_addr = "127.0.0.1:9090"

[limits]
connection_buffer = 16
max_devices_per_room = 8

[rooms]
grace_period_ms = 1000
default_grid_size = 6

[sync]
safety_margin_ms = 80
latency_smoothing = 0.5

[auth]
bearer_token = "secret123"

[records]
backend = "memory"

[[records.parties]]
code = "LIVINGRM"
name = "Living room"
grid_size = 4
"#;
        let cfg: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.listen_addr(), "127.0.0.1:9090");
        assert_eq!(cfg.limits.connection_buffer, 16);
        assert_eq!(cfg.limits.max_ws_per_ip, 20);
        assert_eq!(cfg.rooms.grace_period_ms, 1000);
        assert_eq!(cfg.sync.safety_margin_ms, 80);
        assert_eq!(cfg.auth.bearer_token.as_deref(), Some("secret123"));
        assert_eq!(cfg.records.parties.len(), 1);
        assert_eq!(cfg.records.parties[0].grid_size, Some(4));
        cfg.validate().unwrap();

        let settings = cfg.room_settings();
        assert_eq!(settings.grid_size, 6);
        assert_eq!(settings.max_devices, 8);
        assert_eq!(settings.safety_margin_ms, 80);
    }

    #[test]
    fn missing_sections_use_defaults() {
        let cfg: ServerConfig = toml::from_str("listen_addr = \"0.0.0.0:8080\"").unwrap();
        assert_eq!(cfg.limits.max_ws_connections, 1000);
        assert_eq!(cfg.rooms.default_grid_size, DEFAULT_GRID_SIZE);
        assert_eq!(cfg.sync.safety_margin_ms, DEFAULT_SAFETY_MARGIN_MS);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = ServerConfig {
            listen_addr: "not-an-address".into(),
            ..ServerConfig::default()
        };
        assert!(cfg.validate().is_err());

        cfg = ServerConfig::default();
        cfg.rooms.default_grid_size = 40;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("default_grid_size"));

        cfg = ServerConfig::default();
        cfg.sync.liveness_timeout_ms = cfg.sync.ping_interval_ms;
        assert!(cfg.validate().is_err());

        cfg = ServerConfig::default();
        cfg.records.backend = RecordsBackend::Http;
        assert!(cfg.validate().is_err());
        cfg.records.base_url = Some("https://records.example".into());
        cfg.validate().unwrap();

        cfg = ServerConfig::default();
        cfg.records.parties.push(PartySeed {
            code: "no!".into(),
            id: None,
            name: String::new(),
            grid_size: None,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("SYNCPARTY_LISTEN_ADDR", "127.0.0.1:7000"),
            ("SYNCPARTY_API_TOKEN", "tok"),
            ("SYNCPARTY_RECORDS_BACKEND", "http"),
            ("SYNCPARTY_RECORDS_URL", "http://records:8000/api"),
            ("SYNCPARTY_SAFETY_MARGIN_MS", "75"),
            ("SYNCPARTY_WS_RATE_LIMIT", "not-a-number"),
            ("SYNCPARTY_RECORDS_TOKEN", ""),
        ]
        .into_iter()
        .collect();

        let mut cfg = ServerConfig::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.listen_addr(), "127.0.0.1:7000");
        assert_eq!(cfg.auth.bearer_token.as_deref(), Some("tok"));
        assert_eq!(cfg.records.backend, RecordsBackend::Http);
        assert_eq!(cfg.sync.safety_margin_ms, 75);
        assert!((cfg.limits.ws_rate_limit_per_sec - 20.0).abs() < f64::EPSILON);
        assert!(cfg.records.token.is_none());
        cfg.validate().unwrap();
    }
}
