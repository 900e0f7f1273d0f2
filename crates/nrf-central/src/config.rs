//! Configuration types for the BLE central session
//!
//! This module provides configuration structures for the dongle link, scan
//! parameters, target selection, pairing, service discovery and data I/O.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CentralError, Result};
use crate::pairing::{AuthConfig, IoCapabilities, Passkey};
use crate::peer::{normalize_address, ADDRESS_LEN};
use crate::services::{default_service_queries, ServiceQuery};

/// Default baud rate for the dongle's serial link
pub const DEFAULT_BAUD_RATE: u32 = 1_000_000;

/// Default timeout for a single data read or write
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 2000;

/// Default scan interval
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 200;

/// Default scan window
pub const DEFAULT_SCAN_WINDOW_MS: u64 = 50;

/// Shortest scan interval/window the radio accepts
pub const MIN_SCAN_PERIOD: Duration = Duration::from_micros(2500);

/// Longest scan interval/window the radio accepts
pub const MAX_SCAN_PERIOD: Duration = Duration::from_millis(10240);

/// Maximum number of report characteristic handles fetched per session
pub const MAX_REPORT_ENTRIES: usize = 256;

/// Maximum number of report reference bytes fetched per session
pub const MAX_REPORT_REF_BYTES: usize = 512;

/// Capacity of the outward notification channel
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;

fn default_port() -> String {
    if cfg!(windows) {
        "COM3".to_string()
    } else {
        "/dev/ttyACM0".to_string()
    }
}

/// Main configuration for a central session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentralConfig {
    /// Serial link to the dongle
    #[serde(default)]
    pub link: DongleLink,

    /// Scan parameters
    #[serde(default)]
    pub scan: ScanParams,

    /// Connection target selection
    #[serde(default)]
    pub selection: SelectionConfig,

    /// Pairing parameters
    #[serde(default)]
    pub auth: AuthConfig,

    /// Ordered list of services to discover after authentication
    #[serde(default = "default_service_queries")]
    pub services: Vec<ServiceQuery>,

    /// Data I/O settings
    #[serde(default)]
    pub io: IoConfig,

    /// Capacity of the notification broadcast channel
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

fn default_notification_capacity() -> usize {
    DEFAULT_NOTIFICATION_CAPACITY
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            link: DongleLink::default(),
            scan: ScanParams::default(),
            selection: SelectionConfig::default(),
            auth: AuthConfig::default(),
            services: default_service_queries(),
            io: IoConfig::default(),
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

impl CentralConfig {
    /// Load configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: CentralConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot check on its own
    pub fn validate(&self) -> Result<()> {
        self.scan.validate()?;

        if let Some(address) = &self.selection.address {
            let digits = normalize_address(address);
            if digits.len() != ADDRESS_LEN * 2 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(CentralError::InvalidConfig(format!(
                    "filter address '{}' is not 12 hex digits",
                    address
                )));
            }
        }

        if self.services.is_empty() {
            return Err(CentralError::InvalidConfig(
                "service query list is empty".to_string(),
            ));
        }

        if self.notification_capacity == 0 {
            return Err(CentralError::InvalidConfig(
                "notification_capacity must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Serial link to the dongle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DongleLink {
    /// Serial port name (e.g. COM3, /dev/ttyACM0)
    #[serde(default = "default_port")]
    pub port: String,

    /// Baud rate (default: 1000000)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

impl Default for DongleLink {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Radio scan parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanParams {
    /// Time between the starts of two scan windows
    #[serde(with = "humantime_serde", default = "default_scan_interval")]
    pub interval: Duration,

    /// Listening time per interval
    #[serde(with = "humantime_serde", default = "default_scan_window")]
    pub window: Duration,

    /// Request scan responses from advertisers
    #[serde(default = "default_active_scan")]
    pub active: bool,

    /// Scan timeout in seconds (0 = scan until stopped)
    #[serde(default)]
    pub timeout_secs: u16,
}

fn default_scan_interval() -> Duration {
    Duration::from_millis(DEFAULT_SCAN_INTERVAL_MS)
}

fn default_scan_window() -> Duration {
    Duration::from_millis(DEFAULT_SCAN_WINDOW_MS)
}

fn default_active_scan() -> bool {
    true
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            interval: default_scan_interval(),
            window: default_scan_window(),
            active: true,
            timeout_secs: 0,
        }
    }
}

impl ScanParams {
    /// Check interval and window against the radio's limits
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("interval", self.interval), ("window", self.window)] {
            if value < MIN_SCAN_PERIOD || value > MAX_SCAN_PERIOD {
                return Err(CentralError::InvalidScanParams(format!(
                    "{} {} outside 2.5ms..10240ms",
                    name,
                    humantime::format_duration(value)
                )));
            }
        }

        if self.window > self.interval {
            return Err(CentralError::InvalidScanParams(
                "window is longer than interval".to_string(),
            ));
        }

        Ok(())
    }

    /// Interval in milliseconds, as the dongle expects it
    pub fn interval_ms(&self) -> f32 {
        self.interval.as_micros() as f32 / 1000.0
    }

    /// Window in milliseconds, as the dongle expects it
    pub fn window_ms(&self) -> f32 {
        self.window.as_micros() as f32 / 1000.0
    }
}

/// How the connection target is chosen from scan results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    /// Lock the first peer that passes the address/RSSI filter
    #[default]
    Filtered,
    /// Only lock a peer the user picks explicitly
    Manual,
}

/// Target selection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Selection mode
    #[serde(default)]
    pub mode: SelectionMode,

    /// Exact peer address to accept (separators and case ignored)
    #[serde(default)]
    pub address: Option<String>,

    /// Minimum RSSI in dBm for a peer to be accepted
    #[serde(default = "default_min_rssi")]
    pub min_rssi: i8,

    /// Start connecting as soon as the filter locks a target
    #[serde(default)]
    pub auto_connect: bool,
}

fn default_min_rssi() -> i8 {
    i8::MIN
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            mode: SelectionMode::Filtered,
            address: None,
            min_rssi: i8::MIN,
            auto_connect: false,
        }
    }
}

/// Data I/O settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoConfig {
    /// Timeout applied to each read or write
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

fn default_request_timeout() -> Duration {
    Duration::from_millis(DEFAULT_IO_TIMEOUT_MS)
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
        }
    }
}

/// Builder for CentralConfig
#[derive(Debug, Default)]
pub struct CentralConfigBuilder {
    config: CentralConfig,
}

impl CentralConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set serial port name
    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.config.link.port = port.into();
        self
    }

    /// Set serial baud rate
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.config.link.baud_rate = baud_rate;
        self
    }

    /// Set scan parameters
    pub fn scan(mut self, scan: ScanParams) -> Self {
        self.config.scan = scan;
        self
    }

    /// Set selection mode
    pub fn selection_mode(mut self, mode: SelectionMode) -> Self {
        self.config.selection.mode = mode;
        self
    }

    /// Accept only the peer with this address
    pub fn target_address(mut self, address: impl Into<String>) -> Self {
        self.config.selection.address = Some(address.into());
        self
    }

    /// Set the minimum RSSI threshold
    pub fn min_rssi(mut self, rssi: i8) -> Self {
        self.config.selection.min_rssi = rssi;
        self
    }

    /// Enable or disable connecting as soon as a target locks
    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.config.selection.auto_connect = enabled;
        self
    }

    /// Set the fixed pairing passkey (sanitised to six digits)
    pub fn passkey(mut self, passkey: &str) -> Self {
        self.config.auth.passkey = Some(Passkey::sanitize(passkey));
        self
    }

    /// Set the local I/O capability class
    pub fn io_caps(mut self, caps: IoCapabilities) -> Self {
        self.config.auth.io_caps = caps;
        self
    }

    /// Replace the service query list
    pub fn services(mut self, services: Vec<ServiceQuery>) -> Self {
        self.config.services = services;
        self
    }

    /// Set the data I/O timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.io.request_timeout = timeout;
        self
    }

    /// Build the configuration
    pub fn build(self) -> CentralConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
