//! TOML-based configuration for the card-reader engine.
//!
//! Reads and writes `ReaderConfig` to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\KioskReader\config.toml`
//! - Linux:    `~/.config/kiosk-reader/config.toml`
//! - macOS:    `~/Library/Application Support/KioskReader/config.toml`
//!
//! An explicit path (the `--config` flag) overrides the platform location.
//!
//! # Example file
//!
//! ```toml
//! [reader]
//! vendor_id = 2049          # 0x0801
//! backend = "hid"
//!
//! [transaction]
//! default_timeout_secs = 30
//! payment_methods = ["swipe", "contact", "contactless"]
//! beep_on_completion = true
//!
//! [hid]
//! report_size = 64
//! read_timeout_ms = 100
//! liveness_interval_ms = 2000
//!
//! [logging]
//! log_level = "info"
//! ```
//!
//! # Serde default values
//!
//! Every field carries `#[serde(default = "some_fn")]`, and every section is
//! `#[serde(default)]`, so an empty file, a file from an older release, or no
//! file at all still yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reader_core::{PaymentMethod, PaymentMethods};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::infrastructure::transport::HidTransportConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Which transport the binary drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Raw HID reports through the system HID library.
    #[default]
    Hid,
    /// The in-memory simulated reader.
    Simulated,
}

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ReaderConfig {
    #[serde(default)]
    pub reader: ReaderSection,
    #[serde(default)]
    pub transaction: TransactionSection,
    #[serde(default)]
    pub hid: HidSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Which physical reader to use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReaderSection {
    /// USB vendor id of the reader family.
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,
    /// Restricts discovery to one product id when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u16>,
    /// Connects to this serial number instead of the first reader found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub backend: BackendKind,
}

/// Transaction defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionSection {
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Any of `"swipe"`, `"contact"`, `"contactless"` (aliases accepted).
    #[serde(default = "default_payment_methods")]
    pub payment_methods: Vec<String>,
    #[serde(default = "default_true")]
    pub beep_on_completion: bool,
}

/// Raw HID transport tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HidSection {
    #[serde(default = "default_report_size")]
    pub report_size: usize,
    /// Per-read timeout of the background read loop.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// How often the read loop checks that the reader is still attached.
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSection {
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_vendor_id() -> u16 {
    0x0801
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_payment_methods() -> Vec<String> {
    vec![
        "swipe".to_string(),
        "contact".to_string(),
        "contactless".to_string(),
    ]
}
fn default_true() -> bool {
    true
}
fn default_report_size() -> usize {
    reader_core::protocol::packet::DEFAULT_REPORT_SIZE
}
fn default_read_timeout_ms() -> u64 {
    100
}
fn default_liveness_interval_ms() -> u64 {
    2000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ReaderSection {
    fn default() -> Self {
        Self {
            vendor_id: default_vendor_id(),
            product_id: None,
            serial_number: None,
            backend: BackendKind::default(),
        }
    }
}

impl Default for TransactionSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            payment_methods: default_payment_methods(),
            beep_on_completion: default_true(),
        }
    }
}

impl Default for HidSection {
    fn default() -> Self {
        Self {
            report_size: default_report_size(),
            read_timeout_ms: default_read_timeout_ms(),
            liveness_interval_ms: default_liveness_interval_ms(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl TransactionSection {
    /// Parses `payment_methods`.  Unknown names are logged and skipped.
    pub fn payment_methods(&self) -> PaymentMethods {
        self.payment_methods
            .iter()
            .filter_map(|name| match name.parse::<PaymentMethod>() {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!("ignoring payment method {name:?} in config: {e}");
                    None
                }
            })
            .collect()
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

impl ReaderConfig {
    /// Builds the HID transport settings from the `[reader]` and `[hid]`
    /// sections.
    pub fn hid_transport_config(&self) -> HidTransportConfig {
        HidTransportConfig {
            vendor_id: self.reader.vendor_id,
            product_id: self.reader.product_id,
            serial_number: self.reader.serial_number.clone(),
            report_size: self.hid.report_size,
            read_timeout: Duration::from_millis(self.hid.read_timeout_ms),
            liveness_interval: Duration::from_millis(self.hid.liveness_interval_ms),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the platform config file.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads `ReaderConfig` from `path`, or from the platform location when
/// `path` is `None`.  A missing file yields `ReaderConfig::default()`.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: Option<&Path>) -> Result<ReaderConfig, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ReaderConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Persists `config` to `path` (or the platform location), creating the
/// directory if needed.
pub fn save_config(config: &ReaderConfig, path: Option<&Path>) -> Result<(), ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("KioskReader"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("kiosk-reader"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("KioskReader")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
