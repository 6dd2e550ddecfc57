//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, optional)
//! 2. Environment variables (prefixed with `M2KCAL_`)
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore, so field names that
//! contain single underscores stay intact:
//!
//! ```text
//! M2KCAL_APPLICATION__LOG_LEVEL=debug
//! M2KCAL_CALIBRATION__OFFSET_SAMPLES=32768
//! M2KCAL_SIMULATION__NOISE_LSB=0.0
//! ```
//!
//! # Example
//!
//! ```no_run
//! use m2k_calibration::config::AppConfig;
//!
//! let config = AppConfig::load_from("config/m2k-calibration.toml")?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), m2k_calibration::config::ConfigError>(())
//! ```

use std::path::{Path, PathBuf};

use daq_calibration::{CalibrationSettings, SimulationConfig};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/m2k-calibration.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "M2KCAL_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Calibration tuning and device layout
    pub calibration: CalibrationSettings,
    /// Parameters of the simulated instrument
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name, recorded in reports
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Where to write the JSON report when no path is given on the command line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "m2k-calibration".to_string(),
            log_level: "info".to_string(),
            report_path: None,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl AppConfig {
    /// Load configuration from the default path and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Precedence (highest to lowest): environment variables, the file,
    /// built-in defaults. A missing file is not an error. The result is
    /// validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::figment(path.as_ref()).extract::<Self>()?.validated()
    }

    /// Provider chain used by [`AppConfig::load_from`].
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn validated(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Application name is not empty
    /// - Calibration settings are usable
    /// - Simulated converter scales are positive
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.application.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "application name cannot be empty".to_string(),
            ));
        }

        self.calibration
            .validate()
            .map_err(|msg| ConfigError::ValidationError(format!("calibration: {}", msg)))?;

        let sim = &self.simulation;
        if sim
            .adc_volts_per_lsb
            .iter()
            .chain(&sim.dac_volts_per_lsb)
            .any(|v| !(v.is_finite() && *v > 0.0))
        {
            return Err(ConfigError::ValidationError(
                "simulation: volts per LSB must be positive".to_string(),
            ));
        }
        if sim.noise_lsb < 0.0 {
            return Err(ConfigError::ValidationError(
                "simulation: noise_lsb must not be negative".to_string(),
            ));
        }

        Ok(())
    }
}
