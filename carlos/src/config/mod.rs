//! Process configuration.
//!
//! Built in three layers: defaults, then an optional TOML file (path from
//! `CARLOS_CONFIG`, default `config.toml`), then environment variables. A
//! `.env` file is loaded into the environment first.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::acquisition::AcquisitionConfig;
use crate::scheduler::SchedulerConfig;
use crate::{Error, Result};

const CONFIG_PATH_ENV: &str = "CARLOS_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Which receiver backend to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceBackendKind {
    #[default]
    RtlSdr,
    Simulated,
}

impl DeviceBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RtlSdr => "rtl_sdr",
            Self::Simulated => "simulated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rtl_sdr" | "rtlsdr" => Some(Self::RtlSdr),
            "simulated" => Some(Self::Simulated),
            _ => None,
        }
    }
}

/// Receiver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: DeviceBackendKind,
    pub index: u32,
    /// `0` lets the tuner pick.
    pub bandwidth_hz: u32,
    pub bias_tee: bool,
    pub rtl_sdr_path: PathBuf,
    pub rtl_test_path: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: DeviceBackendKind::RtlSdr,
            index: 0,
            bandwidth_hz: 0,
            bias_tee: true,
            rtl_sdr_path: PathBuf::from("rtl_sdr"),
            rtl_test_path: PathBuf::from("rtl_test"),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind_address: String,
    pub port: u16,
    pub database_url: String,
    /// Base directory for per-recording output and archives.
    pub record_path: PathBuf,
    pub log_dir: PathBuf,
    pub poll_interval_ms: u64,
    /// Free space to keep on the record disk. `0` disables the check.
    pub min_free_disk_bytes: u64,
    pub device: DeviceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            database_url: "sqlite:carlos.db?mode=rwc".to_string(),
            record_path: PathBuf::from("./recordings"),
            log_dir: PathBuf::from("./logs"),
            poll_interval_ms: 1000,
            min_free_disk_bytes: 0,
            device: DeviceConfig::default(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{} has an invalid value: '{}'", key, value)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!(
            "{} must be a boolean, got '{}'",
            key, value
        ))),
    }
}

impl AppConfig {
    /// Load from `.env`, the config file and the process environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let mut config = Self::from_file_or_default(Path::new(&path))?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(format!("invalid config file: {}", e)))
    }

    /// Read `path`, or fall back to defaults when it does not exist.
    pub fn from_file_or_default(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                info!("Loaded configuration from {}", path.display());
                Self::from_toml_str(&text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(Error::config(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Apply `CARLOS_*` / `DATABASE_URL` overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("CARLOS_BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Some(v) = get("CARLOS_PORT") {
            self.port = parse_env("CARLOS_PORT", &v)?;
        }
        if let Some(v) = get("DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = get("CARLOS_RECORD_PATH") {
            self.record_path = PathBuf::from(v);
        }
        if let Some(v) = get("CARLOS_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Some(v) = get("CARLOS_POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse_env("CARLOS_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("CARLOS_MIN_FREE_DISK_BYTES") {
            self.min_free_disk_bytes = parse_env("CARLOS_MIN_FREE_DISK_BYTES", &v)?;
        }
        if let Some(v) = get("CARLOS_DEVICE_BACKEND") {
            self.device.backend = DeviceBackendKind::parse(&v).ok_or_else(|| {
                Error::config(format!("unknown device backend '{}'", v))
            })?;
        }
        if let Some(v) = get("CARLOS_DEVICE_INDEX") {
            self.device.index = parse_env("CARLOS_DEVICE_INDEX", &v)?;
        }
        if let Some(v) = get("CARLOS_DEVICE_BANDWIDTH_HZ") {
            self.device.bandwidth_hz = parse_env("CARLOS_DEVICE_BANDWIDTH_HZ", &v)?;
        }
        if let Some(v) = get("CARLOS_DEVICE_BIAS_TEE") {
            self.device.bias_tee = parse_bool("CARLOS_DEVICE_BIAS_TEE", &v)?;
        }
        if let Some(v) = get("CARLOS_RTL_SDR_PATH") {
            self.device.rtl_sdr_path = PathBuf::from(v);
        }
        if let Some(v) = get("CARLOS_RTL_TEST_PATH") {
            self.device.rtl_test_path = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::config("port must be non-zero"));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::config("poll_interval_ms must be positive"));
        }
        if self.record_path.as_os_str().is_empty() {
            return Err(Error::config("record_path must not be empty"));
        }
        if self.database_url.trim().is_empty() {
            return Err(Error::config("database_url must not be empty"));
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn acquisition_config(&self) -> AcquisitionConfig {
        AcquisitionConfig {
            device_index: self.device.index,
            bandwidth_hz: self.device.bandwidth_hz,
            bias_tee: self.device.bias_tee,
            min_free_disk_bytes: self.min_free_disk_bytes,
        }
    }
}
