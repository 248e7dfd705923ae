//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! The file plays the role of the persistent settings store: endpoint,
//! credentials and update frequency are read from it once at startup. Those
//! three are deliberately not validated here; the lifecycle controller checks
//! them so that a bad value ends up as a diagnostic line instead of a load
//! error.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{Result, TrackerError};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub auth: AuthConfig,
    pub tracking: TrackingConfig,
    pub positioning: PositioningConfig,
    pub diagnostics: DiagnosticsConfig,
    pub wake: WakeConfig,
    pub logging: LoggingConfig,
}

/// Remote store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_auth_url")]
    pub auth_url: String,

    #[serde(default = "default_token_url")]
    pub token_url: String,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// User credentials
#[derive(Deserialize, Clone, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub email: String,

    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Sampling configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TrackingConfig {
    #[serde(default = "default_update_frequency")]
    pub update_frequency: String,
}

/// Positioning source configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PositioningConfig {
    #[serde(default = "default_gpsd_address")]
    pub gpsd_address: String,
}

/// Observer socket configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    #[serde(default = "default_client_queue")]
    pub client_queue: usize,
}

/// Wake lock configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WakeConfig {
    #[serde(default = "default_wake_enabled")]
    pub enabled: bool,

    #[serde(default = "default_wake_name")]
    pub name: String,

    #[serde(default = "default_sysfs_dir")]
    pub sysfs_dir: String,
}

/// Process log output
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub dir: String,
}

// Default value functions
fn default_auth_url() -> String { "https://identitytoolkit.googleapis.com".to_string() }
fn default_token_url() -> String { "https://securetoken.googleapis.com".to_string() }
fn default_request_timeout_ms() -> u64 { 10000 }

fn default_update_frequency() -> String { "5m".to_string() }

fn default_gpsd_address() -> String { "127.0.0.1:2947".to_string() }

fn default_socket_path() -> String { "/tmp/location-tracker.sock".to_string() }
fn default_client_queue() -> usize { 64 }

fn default_wake_enabled() -> bool { true }
fn default_wake_name() -> String { "location-tracker".to_string() }
fn default_sysfs_dir() -> String { "/sys/power".to_string() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self { update_frequency: default_update_frequency() }
    }
}

impl Default for PositioningConfig {
    fn default() -> Self {
        Self { gpsd_address: default_gpsd_address() }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            client_queue: default_client_queue(),
        }
    }
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            enabled: default_wake_enabled(),
            name: default_wake_name(),
            sysfs_dir: default_sysfs_dir(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use location_tracker::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the settings that are not startup preconditions
    fn validate(&self) -> Result<()> {
        if self.positioning.gpsd_address.is_empty() {
            return Err(TrackerError::Config(
                toml::de::Error::custom("gpsd_address cannot be empty")
            ));
        }

        if self.diagnostics.socket_path.is_empty() {
            return Err(TrackerError::Config(
                toml::de::Error::custom("socket_path cannot be empty")
            ));
        }

        if self.diagnostics.client_queue == 0 {
            return Err(TrackerError::Config(
                toml::de::Error::custom("client_queue must be greater than 0")
            ));
        }

        if self.store.request_timeout_ms == 0 || self.store.request_timeout_ms > 60000 {
            return Err(TrackerError::Config(
                toml::de::Error::custom("request_timeout_ms must be between 1 and 60000")
            ));
        }

        if self.wake.enabled && self.wake.name.is_empty() {
            return Err(TrackerError::Config(
                toml::de::Error::custom("wake lock name cannot be empty when enabled")
            ));
        }

        Ok(())
    }
}

/// Parse an update frequency such as `30s`, `5m` or `2h` into seconds.
///
/// The whole string must be digits followed by one unit letter. Anything else,
/// including overflow, yields `0`, which the caller rejects.
///
/// # Examples
///
/// ```
/// use location_tracker::config::parse_update_frequency;
///
/// assert_eq!(parse_update_frequency("5m"), 300);
/// assert_eq!(parse_update_frequency("abc"), 0);
/// ```
pub fn parse_update_frequency(value: &str) -> u64 {
    let Some(unit) = value.chars().last() else {
        return 0;
    };

    let multiplier = match unit {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        _ => return 0,
    };

    let digits = &value[..value.len() - 1];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return 0;
    }

    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .unwrap_or(0)
}
