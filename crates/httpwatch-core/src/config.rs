//! Configuration system for httpwatch
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation of port ranges, table capacities and capture size

use crate::conn::PortRange;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpwatchConfig {
    pub sensor: SensorSettings,
    pub capture: CaptureSettings,
    pub ports: PortSettings,
    pub tables: TableSettings,
}

/// Sensor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Capture settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// OpenSSL-style adapter
    pub native_ssl: bool,

    /// GnuTLS-style adapter
    pub gnutls: bool,

    /// Go crypto/tls adapter
    pub go_tls: bool,

    /// Unencrypted packet path
    pub plaintext: bool,

    /// Shared-library open detection
    pub library_loads: bool,

    /// PID filter (capture only these PIDs, empty = all)
    pub pid_filter: Vec<u32>,

    /// Bytes of payload copied into each observed-bytes event
    pub max_capture_bytes: usize,

    /// Port whose packets carry TLS records (skipped by the plaintext path)
    pub https_port: u16,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            native_ssl: true,
            gnutls: true,
            go_tls: true,
            plaintext: true,
            library_loads: true,
            pid_filter: Vec::new(),
            max_capture_bytes: 160,
            https_port: 443,
        }
    }
}

/// Ephemeral port range used by tuple normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    pub ephemeral_min: u16,
    pub ephemeral_max: u16,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            ephemeral_min: PortRange::LINUX_DEFAULT.min,
            ephemeral_max: PortRange::LINUX_DEFAULT.max,
        }
    }
}

impl PortSettings {
    pub fn range(&self) -> PortRange {
        PortRange::new(self.ephemeral_min, self.ephemeral_max)
    }
}

/// Capacities of the bounded tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSettings {
    /// Handle tables (session identities, BIO descriptors, handshakes)
    pub handles: usize,

    /// Per-thread call tables
    pub calls: usize,

    /// Per-goroutine call tables
    pub goroutines: usize,

    /// Go connection object to identity
    pub go_conns: usize,

    /// Pending file opens
    pub open_at: usize,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            handles: 1024,
            calls: 1024,
            goroutines: 2048,
            go_conns: 1024,
            open_at: 1024,
        }
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. HTTPWATCH_CONFIG environment variable
    /// 3. $XDG_CONFIG_HOME/httpwatch/config.toml
    /// 4. /etc/httpwatch/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<HttpwatchConfig> {
        let mut config = if let Some(path) = self.find_config_file() {
            info!("Loading configuration from: {}", path.display());
            Self::load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            HttpwatchConfig::default()
        };

        apply_overrides(&mut config, |key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("HTTPWATCH_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("HTTPWATCH_CONFIG path does not exist: {}", env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        let system = PathBuf::from("/etc/httpwatch/config.toml");
        if system.exists() {
            return Some(system);
        }

        None
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> ConfigResult<HttpwatchConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: HttpwatchConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Render configuration as TOML
    pub fn to_toml(config: &HttpwatchConfig) -> ConfigResult<String> {
        toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })
    }

    /// Save configuration to a file
    pub fn save(config: &HttpwatchConfig, path: &Path) -> ConfigResult<()> {
        let content = Self::to_toml(config)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// User config path: `$XDG_CONFIG_HOME/httpwatch/config.toml`,
    /// falling back to `~/.config`
    pub fn default_config_path() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
            .map(|d| d.join("httpwatch").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `HTTPWATCH_*` overrides using `lookup` to read variables
pub fn apply_overrides<F>(config: &mut HttpwatchConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("HTTPWATCH_LOG_LEVEL") {
        config.sensor.log_level = val;
    }

    let switches: [(&str, &mut bool); 5] = [
        ("HTTPWATCH_CAPTURE_NATIVE_SSL", &mut config.capture.native_ssl),
        ("HTTPWATCH_CAPTURE_GNUTLS", &mut config.capture.gnutls),
        ("HTTPWATCH_CAPTURE_GO_TLS", &mut config.capture.go_tls),
        ("HTTPWATCH_CAPTURE_PLAINTEXT", &mut config.capture.plaintext),
        (
            "HTTPWATCH_CAPTURE_LIBRARY_LOADS",
            &mut config.capture.library_loads,
        ),
    ];
    for (key, slot) in switches {
        if let Some(val) = lookup(key) {
            *slot = val.parse().unwrap_or(*slot);
        }
    }

    if let Some(val) = lookup("HTTPWATCH_CAPTURE_PID_FILTER") {
        config.capture.pid_filter = val
            .split(',')
            .filter_map(|p| p.trim().parse().ok())
            .collect();
    }

    if let Some(val) = lookup("HTTPWATCH_MAX_CAPTURE_BYTES") {
        if let Ok(n) = val.parse() {
            config.capture.max_capture_bytes = n;
        }
    }
}

impl HttpwatchConfig {
    /// Validate configuration
    pub fn validate(&self) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.sensor.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.sensor.log_level, valid_levels
            )));
        }

        if self.ports.ephemeral_min == 0 || self.ports.ephemeral_min > self.ports.ephemeral_max {
            return Err(ConfigError::ValidationError(format!(
                "Invalid ephemeral port range: {}..={}",
                self.ports.ephemeral_min, self.ports.ephemeral_max
            )));
        }

        if self.capture.max_capture_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "max_capture_bytes cannot be 0".to_string(),
            ));
        }

        let capacities = [
            ("handles", self.tables.handles),
            ("calls", self.tables.calls),
            ("goroutines", self.tables.goroutines),
            ("go_conns", self.tables.go_conns),
            ("open_at", self.tables.open_at),
        ];
        for (name, cap) in capacities {
            if cap == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Table capacity '{}' cannot be 0",
                    name
                )));
            }
        }

        Ok(())
    }
}
