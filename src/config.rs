//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `SCREEN_PROFILE_`, nesting with `__`
//!
//! ```text
//! SCREEN_PROFILE_APPLICATION__LOG_LEVEL=debug
//! SCREEN_PROFILE_MEASUREMENT__N_SHOTS=10
//! SCREEN_PROFILE_MEASUREMENT__SAVE_DATA=true
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! log_level = "info"
//!
//! [measurement]
//! name = "OTR2 profile"
//! n_shots = 5
//! fit_profile = true
//! save_data = true
//! destination = "data/otr2.bpc"
//! backend = "container"
//! settle_ms = 100
//!
//! [measurement.beam_fit]
//! type = "ImageProjectionFit"
//! signal_to_noise_threshold = 3.0
//! ```
//!
//! Everything is validated on load, so an unknown fit type or a missing destination is
//! reported before any measurement is attempted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, ProfileError};
use crate::fit::{build_fit, FitSpec};
use crate::storage::StorageBackend;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "SCREEN_PROFILE_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Application settings.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Measurement settings.
    #[serde(default)]
    pub measurement: MeasurementConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name.
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Per-measurement configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// Measurement name.
    #[serde(default = "default_measurement_name")]
    pub name: String,
    /// Shots taken by `measure_configured`.
    #[serde(default = "default_n_shots")]
    pub n_shots: i64,
    /// Fit every acquired image.
    #[serde(default = "default_true")]
    pub fit_profile: bool,
    /// Persist the result tree after each measurement.
    #[serde(default)]
    pub save_data: bool,
    /// Where results are persisted. A directory gets a timestamped file.
    #[serde(default)]
    pub destination: Option<PathBuf>,
    /// Storage backend.
    #[serde(default)]
    pub backend: StorageBackend,
    /// Wait between consecutive image pulls, in milliseconds.
    #[serde(default)]
    pub settle_ms: u64,
    /// Fit strategy record.
    #[serde(default)]
    pub beam_fit: FitSpec,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            name: default_measurement_name(),
            n_shots: default_n_shots(),
            fit_profile: true,
            save_data: false,
            destination: None,
            backend: StorageBackend::default(),
            settle_ms: 0,
            beam_fit: FitSpec::default(),
        }
    }
}

impl MeasurementConfig {
    /// Inter-pull wait, if any.
    pub fn settle_time(&self) -> Option<Duration> {
        (self.settle_ms > 0).then(|| Duration::from_millis(self.settle_ms))
    }

    /// Checks the measurement section on its own.
    pub fn validate(&self) -> AppResult<()> {
        if self.n_shots <= 0 {
            return Err(ProfileError::Configuration(format!(
                "measurement.n_shots must be positive, got {}",
                self.n_shots
            )));
        }
        if self.save_data && self.destination.is_none() {
            return Err(ProfileError::Configuration(
                "measurement.save_data is enabled but no destination is set".into(),
            ));
        }
        self.backend.ensure_available()?;
        build_fit(&self.beam_fit)?;
        Ok(())
    }
}

fn default_app_name() -> String {
    "screen_profile".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_measurement_name() -> String {
    "beam_profile".to_string()
}

fn default_n_shots() -> i64 {
    1
}

fn default_true() -> bool {
    true
}

impl ProfileConfig {
    /// Loads a TOML file merged with environment overrides, then validates.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::extract(
            Figment::new()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Parses a TOML document (no environment overrides), then validates.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Self::extract(Figment::new().merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> AppResult<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks log level, shot count, destination, and fit record.
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ProfileError::Configuration(format!(
                "invalid log level '{}' (expected one of {})",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }
        self.measurement.validate()
    }
}
