//! TOML configuration file for the `miio-client` binary.
//!
//! # Format
//!
//! ```toml
//! [device]
//! ip = "192.168.1.20"
//! port = 54321
//! token = "000102030405060708090a0b0c0d0e0f"
//!
//! [client]
//! local_port = 54321
//! keepalive_secs = 10
//! call_timeout_ms = 400
//! max_missed_keepalives = 3
//! verify_checksum = true
//! legacy_array_params = true
//! match_replies_without_id = true
//! log_level = "info"
//! ```
//!
//! Every field is optional.  Fields annotated with
//! `#[serde(default = "some_fn")]` take the value of `some_fn()` when absent,
//! so an empty file (or no file at all) yields the protocol defaults.  The
//! device IP and token have no default and must come from the file or the
//! command line before [`FileConfig::into_session_config`] succeeds, which
//! also rejects a `keepalive_secs` outside `1..=3600` and a `call_timeout_ms`
//! outside `1..=60000`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use miio_core::{PayloadCompat, Token, TokenError, DEFAULT_DEVICE_PORT};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::application::config::{SessionConfig, MAX_CALL_TIMEOUT, MAX_KEEPALIVE, MIN_KEEPALIVE};

/// Error type for configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// No device IP was configured.
    #[error("no device IP configured")]
    MissingIp,

    /// The device IP is not a valid address.
    #[error("invalid device IP '{0}'")]
    InvalidIp(String),

    /// No device token was configured.
    #[error("no device token configured")]
    MissingToken,

    /// The device token is malformed.
    #[error("invalid device token: {0}")]
    Token(#[from] TokenError),

    /// A numeric setting is outside the range the session can run with.
    #[error("{field} = {value} is out of range ({min}..={max})")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileConfig {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub client: ClientSection,
}

/// The device to talk to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device IP address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Device UDP port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Hex token, raw (32 hex chars) or wrapped (96 hex chars).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Local socket and session tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSection {
    /// Local UDP port to bind; 0 picks any free port.
    #[serde(default = "default_port")]
    pub local_port: u16,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_max_missed_keepalives")]
    pub max_missed_keepalives: u32,
    #[serde(default = "default_true")]
    pub verify_checksum: bool,
    /// Rewrite stringified nested arrays in params (`["[1,2]"]` → `[[1,2]]`).
    #[serde(default = "default_true")]
    pub legacy_array_params: bool,
    /// Let a reply without an `id` resolve the only pending call.
    #[serde(default = "default_true")]
    pub match_replies_without_id: bool,
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_port() -> u16 {
    DEFAULT_DEVICE_PORT
}
fn default_keepalive_secs() -> u64 {
    10
}
fn default_call_timeout_ms() -> u64 {
    400
}
fn default_max_missed_keepalives() -> u32 {
    3
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            ip: None,
            port: default_port(),
            token: None,
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            local_port: default_port(),
            keepalive_secs: default_keepalive_secs(),
            call_timeout_ms: default_call_timeout_ms(),
            max_missed_keepalives: default_max_missed_keepalives(),
            verify_checksum: default_true(),
            legacy_array_params: default_true(),
            match_replies_without_id: default_true(),
            log_level: default_log_level(),
        }
    }
}

// ── Loading and conversion ────────────────────────────────────────────────────

/// Loads a config file, returning `FileConfig::default()` if it does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<FileConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("no config file at {}, using defaults", path.display());
            Ok(FileConfig::default())
        }
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

impl FileConfig {
    /// Validates the file settings and builds a runtime [`SessionConfig`].
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the IP or token is missing or malformed,
    /// or [`ConfigError::OutOfRange`] for an unusable keepalive or timeout.
    pub fn into_session_config(self) -> Result<SessionConfig, ConfigError> {
        let ip_text = self.device.ip.ok_or(ConfigError::MissingIp)?;
        let ip: IpAddr = ip_text
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidIp(ip_text.clone()))?;
        let token: Token = self
            .device
            .token
            .as_deref()
            .ok_or(ConfigError::MissingToken)?
            .parse()?;

        let client = self.client;
        check_range(
            "keepalive_secs",
            client.keepalive_secs,
            MIN_KEEPALIVE.as_secs(),
            MAX_KEEPALIVE.as_secs(),
        )?;
        check_range(
            "call_timeout_ms",
            client.call_timeout_ms,
            1,
            MAX_CALL_TIMEOUT.as_millis() as u64,
        )?;

        Ok(SessionConfig {
            device_addr: SocketAddr::new(ip, self.device.port),
            local_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), client.local_port),
            token,
            keepalive_interval: Duration::from_secs(client.keepalive_secs),
            call_timeout: Duration::from_millis(client.call_timeout_ms),
            max_missed_keepalives: client.max_missed_keepalives,
            verify_checksum: client.verify_checksum,
            match_replies_without_id: client.match_replies_without_id,
            payload_compat: if client.legacy_array_params {
                PayloadCompat::NestedArrayShim
            } else {
                PayloadCompat::Strict
            },
        })
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "000102030405060708090a0b0c0d0e0f";

    #[test]
    fn test_empty_toml_uses_defaults() {
        // Arrange / Act
        let cfg: FileConfig = toml::from_str("").expect("deserialize");

        // Assert
        assert_eq!(cfg, FileConfig::default());
        assert_eq!(cfg.device.port, 54321);
        assert_eq!(cfg.client.local_port, 54321);
        assert_eq!(cfg.client.log_level, "info");
    }

    #[test]
    fn test_partial_client_section_overrides_defaults() {
        // Arrange
        let text = r#"
            [device]
            ip = "10.0.0.5"
            token = "000102030405060708090a0b0c0d0e0f"

            [client]
            keepalive_secs = 30
            legacy_array_params = false
        "#;

        // Act
        let cfg: FileConfig = toml::from_str(text).expect("deserialize");

        // Assert
        assert_eq!(cfg.device.ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(cfg.client.keepalive_secs, 30);
        assert!(!cfg.client.legacy_array_params);
        assert_eq!(cfg.client.call_timeout_ms, 400);
    }

    #[test]
    fn test_into_session_config_maps_every_field() {
        // Arrange
        let mut cfg = FileConfig::default();
        cfg.device.ip = Some("192.168.1.20".into());
        cfg.device.port = 12345;
        cfg.device.token = Some(TOKEN.into());
        cfg.client.local_port = 0;
        cfg.client.keepalive_secs = 5;
        cfg.client.call_timeout_ms = 1000;
        cfg.client.max_missed_keepalives = 7;
        cfg.client.verify_checksum = false;
        cfg.client.legacy_array_params = false;
        cfg.client.match_replies_without_id = false;

        // Act
        let session = cfg.into_session_config().expect("valid config");

        // Assert
        assert_eq!(session.device_addr, "192.168.1.20:12345".parse().unwrap());
        assert_eq!(session.local_addr, "0.0.0.0:0".parse().unwrap());
        assert_eq!(session.token, Token::from_hex(TOKEN).unwrap());
        assert_eq!(session.keepalive_interval, Duration::from_secs(5));
        assert_eq!(session.call_timeout, Duration::from_millis(1000));
        assert_eq!(session.max_missed_keepalives, 7);
        assert!(!session.verify_checksum);
        assert!(!session.match_replies_without_id);
        assert_eq!(session.payload_compat, PayloadCompat::Strict);
    }

    #[test]
    fn test_missing_ip_and_token_are_reported() {
        let cfg = FileConfig::default();
        assert!(matches!(
            cfg.clone().into_session_config(),
            Err(ConfigError::MissingIp)
        ));

        let mut cfg = cfg;
        cfg.device.ip = Some("10.0.0.1".into());
        assert!(matches!(
            cfg.into_session_config(),
            Err(ConfigError::MissingToken)
        ));
    }

    #[test]
    fn test_invalid_ip_and_token_are_rejected() {
        // Arrange
        let mut bad_ip = FileConfig::default();
        bad_ip.device.ip = Some("not-an-ip".into());
        bad_ip.device.token = Some(TOKEN.into());

        let mut bad_token = FileConfig::default();
        bad_token.device.ip = Some("10.0.0.1".into());
        bad_token.device.token = Some("abcd".into());

        // Act / Assert
        assert!(matches!(
            bad_ip.into_session_config(),
            Err(ConfigError::InvalidIp(ip)) if ip == "not-an-ip"
        ));
        assert!(matches!(
            bad_token.into_session_config(),
            Err(ConfigError::Token(_))
        ));
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        // Arrange
        let mut cfg = FileConfig::default();
        cfg.device.ip = Some("10.1.2.3".into());
        cfg.client.max_missed_keepalives = 5;

        // Act
        let text = toml::to_string_pretty(&cfg).expect("serialize");
        let restored: FileConfig = toml::from_str(&text).expect("deserialize");

        // Assert
        assert_eq!(cfg, restored);
    }

    #[test]
    fn test_load_config_missing_file_returns_defaults() {
        // Arrange
        let path = std::env::temp_dir().join("miio-client-test-does-not-exist.toml");

        // Act
        let cfg = load_config(&path).expect("missing file is not an error");

        // Assert
        assert_eq!(cfg, FileConfig::default());
    }

    #[test]
    fn test_load_config_reads_file() {
        // Arrange
        let path =
            std::env::temp_dir().join(format!("miio-client-test-{}.toml", std::process::id()));
        std::fs::write(&path, "[device]\nip = \"10.9.8.7\"\n").unwrap();

        // Act
        let cfg = load_config(&path);
        let _ = std::fs::remove_file(&path);

        // Assert
        assert_eq!(cfg.unwrap().device.ip.as_deref(), Some("10.9.8.7"));
    }

    fn valid() -> FileConfig {
        let mut cfg = FileConfig::default();
        cfg.device.ip = Some("10.0.0.1".into());
        cfg.device.token = Some(TOKEN.into());
        cfg
    }

    #[test]
    fn test_zero_keepalive_and_timeout_are_rejected() {
        // Arrange
        let mut no_keepalive = valid();
        no_keepalive.client.keepalive_secs = 0;
        let mut no_timeout = valid();
        no_timeout.client.call_timeout_ms = 0;

        // Act / Assert
        assert!(matches!(
            no_keepalive.into_session_config(),
            Err(ConfigError::OutOfRange { field: "keepalive_secs", value: 0, .. })
        ));
        assert!(matches!(
            no_timeout.into_session_config(),
            Err(ConfigError::OutOfRange { field: "call_timeout_ms", value: 0, .. })
        ));
    }

    #[test]
    fn test_huge_keepalive_and_timeout_are_rejected() {
        // Arrange
        let mut long_keepalive = valid();
        long_keepalive.client.keepalive_secs = u64::MAX;
        let mut long_timeout = valid();
        long_timeout.client.call_timeout_ms = u64::MAX;

        // Act / Assert
        assert!(matches!(
            long_keepalive.into_session_config(),
            Err(ConfigError::OutOfRange { field: "keepalive_secs", .. })
        ));
        assert!(matches!(
            long_timeout.into_session_config(),
            Err(ConfigError::OutOfRange { field: "call_timeout_ms", .. })
        ));
    }

    #[test]
    fn test_range_bounds_are_inclusive() {
        // Arrange
        let mut cfg = valid();
        cfg.client.keepalive_secs = 3_600;
        cfg.client.call_timeout_ms = 60_000;

        // Act
        let session = cfg.into_session_config().expect("bounds are valid");

        // Assert
        assert_eq!(session.keepalive_interval, Duration::from_secs(3_600));
        assert_eq!(session.call_timeout, Duration::from_secs(60));
    }
}
