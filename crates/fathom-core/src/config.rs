//! Configuration system for Fathom.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FATHOM_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/fathom/config.toml
//!   3. ~/.config/fathom/config.toml
//!
//! Every range below is enforced by [`FathomConfig::validate`] before any
//! component is started; out-of-range values are rejected, not clamped.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Limits & defaults ─────────────────────────────────────────────────────────

/// Per-attempt RPC reply deadline, seconds.
pub const MIN_RPC_TIMEOUT: f64 = 1.0;
pub const MAX_RPC_TIMEOUT: f64 = 5.0;
pub const DEFAULT_RPC_TIMEOUT: f64 = 2.0;

/// RPC attempts; retried only on timeout.
pub const MIN_EXEC: u32 = 1;
pub const MAX_EXEC: u32 = 10;
pub const DEFAULT_EXEC: u32 = 5;

/// Receive buffer pool size, slabs.
pub const MIN_N_BUFFERS: usize = 32;
pub const MAX_N_BUFFERS: usize = 1024;
pub const DEFAULT_N_BUFFERS: usize = 256;

/// Client inactivity window before the server drops the session, seconds.
pub const MIN_IDLE_TIMEOUT: f64 = 5.0;
pub const MAX_IDLE_TIMEOUT: f64 = 600.0;
pub const DEFAULT_IDLE_TIMEOUT: f64 = 10.0;

/// Default RPC listen port.
pub const DEFAULT_RPC_PORT: u16 = 12500;

// ── Enumerations ──────────────────────────────────────────────────────────────

/// Target outbound data rate. Names follow the link class the sonar is
/// deployed on; values are bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetSpeed {
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "10M")]
    M10,
    #[serde(rename = "100M")]
    M100,
    #[serde(rename = "1G")]
    G1,
    #[serde(rename = "10G")]
    G10,
}

impl TargetSpeed {
    pub fn bytes_per_sec(self) -> u64 {
        match self {
            TargetSpeed::Local => 50_000_000_000,
            TargetSpeed::M10 => 10_000_000,
            TargetSpeed::M100 => 100_000_000,
            TargetSpeed::G1 => 1_000_000_000,
            TargetSpeed::G10 => 10_000_000_000,
        }
    }
}

/// UART line discipline: disabled, automatic baud search, or a fixed rate.
/// All fixed rates are 8N1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UartMode {
    #[default]
    #[serde(rename = "disabled")]
    Disabled,
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "4800")]
    B4800,
    #[serde(rename = "9600")]
    B9600,
    #[serde(rename = "19200")]
    B19200,
    #[serde(rename = "38400")]
    B38400,
    #[serde(rename = "57600")]
    B57600,
    #[serde(rename = "115200")]
    B115200,
}

impl UartMode {
    /// Baud rate of a fixed mode; `None` for Disabled and Auto.
    pub fn baud(self) -> Option<u32> {
        match self {
            UartMode::Disabled | UartMode::Auto => None,
            UartMode::B4800 => Some(4_800),
            UartMode::B9600 => Some(9_600),
            UartMode::B19200 => Some(19_200),
            UartMode::B38400 => Some(38_400),
            UartMode::B57600 => Some(57_600),
            UartMode::B115200 => Some(115_200),
        }
    }

    /// The baud cycle walked by automatic mode search. After the last entry
    /// the search wraps to the first.
    pub const AUTO_CYCLE: [UartMode; 6] = [
        UartMode::B4800,
        UartMode::B9600,
        UartMode::B19200,
        UartMode::B38400,
        UartMode::B57600,
        UartMode::B115200,
    ];
}

// ── Configuration tree ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FathomConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub nmea: NmeaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the RPC listener and data sender bind to.
    pub host: String,
    pub port: u16,
    /// Seconds without any RPC call before a client session is dropped.
    pub idle_timeout_secs: f64,
    pub target_speed: TargetSpeed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Sonar server endpoint.
    pub host: String,
    pub port: u16,
    /// Per-attempt RPC deadline, seconds.
    pub timeout_secs: f64,
    /// RPC attempts; only timeouts are retried.
    pub n_exec: u32,
    /// Receive pool size, slabs of one packet each.
    pub n_buffers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NmeaConfig {
    pub uart: UartPortConfig,
    pub udp: UdpPortConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UartPortConfig {
    /// Port name stamped on emitted blocks.
    pub name: String,
    /// Device path, e.g. /dev/ttyUSB0. Empty = port disabled.
    pub device: String,
    pub mode: UartMode,
    /// Drop sentences whose checksum does not verify.
    pub skip_broken: bool,
    /// Source id assigned to blocks forwarded onto the data plane.
    pub source_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpPortConfig {
    pub name: String,
    /// Local address to bind. Empty = port disabled.
    pub bind: String,
    /// Listen port; values below 1024 disable the port.
    pub port: u16,
    pub source_id: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: DEFAULT_RPC_PORT,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT,
            target_speed: TargetSpeed::Local,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: DEFAULT_RPC_PORT,
            timeout_secs: DEFAULT_RPC_TIMEOUT,
            n_exec: DEFAULT_EXEC,
            n_buffers: DEFAULT_N_BUFFERS,
        }
    }
}

impl Default for NmeaConfig {
    fn default() -> Self {
        Self { uart: UartPortConfig::default(), udp: UdpPortConfig::default() }
    }
}

impl Default for UartPortConfig {
    fn default() -> Self {
        Self {
            name: "nmea-uart".to_owned(),
            device: String::new(),
            mode: UartMode::Disabled,
            skip_broken: false,
            source_id: 1,
        }
    }
}

impl Default for UdpPortConfig {
    fn default() -> Self {
        Self { name: "nmea-udp".to_owned(), bind: String::new(), port: 0, source_id: 2 }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("fathom")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("{field} = {value} outside [{min}, {max}]")]
    OutOfRange { field: &'static str, value: f64, min: f64, max: f64 },
    #[error("{0} must not be empty")]
    MissingValue(&'static str),
}

// ── Loading & validation ──────────────────────────────────────────────────────

impl FathomConfig {
    /// Load config: env vars → file → defaults. The result is validated.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::file_path())
    }

    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            FathomConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FATHOM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply FATHOM_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FATHOM_SERVER__HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("FATHOM_SERVER__PORT") {
            if let Ok(p) = v.parse() {
                self.server.port = p;
            }
        }
        if let Ok(v) = std::env::var("FATHOM_CLIENT__HOST") {
            self.client.host = v;
        }
        if let Ok(v) = std::env::var("FATHOM_CLIENT__PORT") {
            if let Ok(p) = v.parse() {
                self.client.port = p;
            }
        }
    }

    /// Reject any out-of-range option before components start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.client.validate()?;
        Ok(())
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::MissingValue("server.host"));
        }
        range("server.idle_timeout_secs", self.idle_timeout_secs, MIN_IDLE_TIMEOUT, MAX_IDLE_TIMEOUT)?;
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.idle_timeout_secs)
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::MissingValue("client.host"));
        }
        range("client.timeout_secs", self.timeout_secs, MIN_RPC_TIMEOUT, MAX_RPC_TIMEOUT)?;
        range("client.n_exec", self.n_exec as f64, MIN_EXEC as f64, MAX_EXEC as f64)?;
        range(
            "client.n_buffers",
            self.n_buffers as f64,
            MIN_N_BUFFERS as f64,
            MAX_N_BUFFERS as f64,
        )?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }
}

fn range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange { field, value, min, max });
    }
    Ok(())
}
