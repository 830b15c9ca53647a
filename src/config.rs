//! Layered configuration for the symbol-cache engine.
//!
//! Mirrors the host application's usual precedence order: programmatic
//! defaults, then an optional YAML file, then environment variables
//! (highest priority), using `figment` exactly as a config-file-driven
//! host would load any other subsystem's settings.

use std::collections::HashMap;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-metric scoring bounds; a metric with no bounds clamps nowhere.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBounds {
    pub min: f64,
    pub max: f64,
}

/// Top-level configuration for the symbol-cache engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Whether every registered filter runs regardless of pre-results
    /// (`RSPAMD_TASK_FLAG_PASS_ALL` in the original).
    pub check_all_filters: bool,

    /// Whether unresolved delayed dependencies are a hard post-load
    /// failure (`true`) or a warning (`false`).
    pub strict_symbols: bool,

    /// Path to the versioned symbol-statistics snapshot file (spec §6).
    pub cache_file: String,

    /// Interval, in seconds, between periodic saves.
    pub save_interval_seconds: u64,

    /// EMA smoothing constant for per-symbol average execution time.
    /// Must be in `(0.0, 1.0]`. Default `1/16`, per spec §9's Open
    /// Question on tunability.
    pub avg_time_alpha: f64,

    /// Per-metric weight table: metric name -> (symbol name -> weight).
    pub weights: HashMap<String, HashMap<String, f64>>,

    /// Optional per-metric score clamp.
    pub score_bounds: HashMap<String, ScoreBounds>,

    /// Structured logging settings.
    pub logging: LoggingSection,
}

/// Logging settings nested under the top-level config, read by
/// [`crate::logging::init`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    pub level: String,
    pub format: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            check_all_filters: false,
            strict_symbols: true,
            cache_file: ".mail-filter/symbols.cache".to_string(),
            save_interval_seconds: 60,
            avg_time_alpha: 1.0 / 16.0,
            weights: HashMap::new(),
            score_bounds: HashMap::new(),
            logging: LoggingSection {
                level: "info".to_string(),
                format: "json".to_string(),
            },
        }
    }
}

/// Configuration validation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid avg_time_alpha: {0}, must be in (0.0, 1.0]")]
    InvalidAvgTimeAlpha(f64),

    #[error("cache_file path cannot be empty")]
    EmptyCacheFile,

    #[error("invalid save_interval_seconds: 0, must be at least 1")]
    InvalidSaveInterval,

    #[error("invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("metric '{0}' has an inverted score range: min {1} > max {2}")]
    InvertedScoreBounds(String, f64, f64),

    #[error("metric '{0}' assigns a non-finite weight to symbol '{1}'")]
    NonFiniteWeight(String, String),

    #[error("failed to extract configuration: {0}")]
    ExtractFailed(String),
}

/// Loads and validates [`CoreConfig`] from the standard precedence chain.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `mail-filter.yaml` (if present)
    /// 3. `MAIL_FILTER_*` environment variables
    pub fn load() -> Result<CoreConfig, ConfigError> {
        let config: CoreConfig = Figment::new()
            .merge(Serialized::defaults(CoreConfig::default()))
            .merge(Yaml::file("mail-filter.yaml"))
            .merge(Env::prefixed("MAIL_FILTER_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ExtractFailed(e.to_string()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, skipping the environment
    /// overlay. Used by tests and by hosts embedding a fixed config path.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<CoreConfig, ConfigError> {
        let config: CoreConfig = Figment::new()
            .merge(Serialized::defaults(CoreConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .map_err(|e| ConfigError::ExtractFailed(e.to_string()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate a loaded configuration.
    pub fn validate(config: &CoreConfig) -> Result<(), ConfigError> {
        if !(config.avg_time_alpha > 0.0 && config.avg_time_alpha <= 1.0) {
            return Err(ConfigError::InvalidAvgTimeAlpha(config.avg_time_alpha));
        }

        if config.cache_file.is_empty() {
            return Err(ConfigError::EmptyCacheFile);
        }

        if config.save_interval_seconds == 0 {
            return Err(ConfigError::InvalidSaveInterval);
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        for (metric, bounds) in &config.score_bounds {
            if bounds.min > bounds.max {
                return Err(ConfigError::InvertedScoreBounds(
                    metric.clone(),
                    bounds.min,
                    bounds.max,
                ));
            }
        }

        for (metric, symbols) in &config.weights {
            for (symbol, weight) in symbols {
                if !weight.is_finite() {
                    return Err(ConfigError::NonFiniteWeight(metric.clone(), symbol.clone()));
                }
            }
        }

        Ok(())
    }
}
