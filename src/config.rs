//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{
    AdaptiveSettings, Algorithm, Category, KeyStrategy, PolicyConfig, StoreSettings,
};

/// Prefix for environment overrides, e.g. `TURNSTILE__STORE__MAX_KEYS=5000`.
const ENV_PREFIX: &str = "TURNSTILE";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Load-adaptive scaling configuration
    #[serde(default)]
    pub adaptive: AdaptiveConfig,

    /// Per-category overrides of the built-in policy table
    #[serde(default)]
    pub policies: HashMap<String, PolicyOverride>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Interval between expiry sweeps in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Maximum keys per policy before least-recently-seen eviction
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            max_keys: default_max_keys(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_max_keys() -> usize {
    100_000
}

impl StoreConfig {
    /// The store settings these values describe.
    pub fn settings(&self) -> StoreSettings {
        StoreSettings {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            max_keys: self.max_keys,
        }
    }
}

/// Load-adaptive scaling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Wrap every policy in an adaptive limiter
    #[serde(default)]
    pub enabled: bool,

    /// Load strictly above which quotas shrink
    #[serde(default = "default_load_threshold")]
    pub load_threshold: f64,

    /// Multiplier applied to quotas under high load
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            load_threshold: default_load_threshold(),
            scale_factor: default_scale_factor(),
        }
    }
}

fn default_load_threshold() -> f64 {
    0.8
}

fn default_scale_factor() -> f64 {
    0.5
}

impl AdaptiveConfig {
    /// The adaptive settings these values describe.
    pub fn settings(&self) -> AdaptiveSettings {
        AdaptiveSettings {
            load_threshold: self.load_threshold,
            scale_factor: self.scale_factor,
        }
    }
}

/// Partial policy definition layered over a category's defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyOverride {
    pub window_ms: Option<u64>,
    pub max_requests: Option<u64>,
    pub message: Option<String>,
    pub key: Option<KeyStrategy>,
    pub algorithm: Option<Algorithm>,
    /// Overrides `adaptive.enabled` for this category
    pub adaptive: Option<bool>,
    pub skip_successful_requests: Option<bool>,
    pub skip_failed_requests: Option<bool>,
}

impl PolicyOverride {
    /// Apply the fields that are set on top of `base`.
    pub fn apply(&self, mut base: PolicyConfig) -> PolicyConfig {
        if let Some(window_ms) = self.window_ms {
            base.window_ms = window_ms;
        }
        if let Some(max_requests) = self.max_requests {
            base.max_requests = max_requests;
        }
        if let Some(ref message) = self.message {
            base.message = message.clone();
        }
        if let Some(key) = self.key {
            base.key = key;
        }
        if let Some(algorithm) = self.algorithm {
            base.algorithm = algorithm;
        }
        if let Some(skip) = self.skip_successful_requests {
            base.skip_successful_requests = skip;
        }
        if let Some(skip) = self.skip_failed_requests {
            base.skip_failed_requests = skip;
        }
        base
    }
}

impl TurnstileConfig {
    /// Load configuration from a file, layered with `TURNSTILE__*`
    /// environment overrides. Without a path only the environment applies.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let config: TurnstileConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges and that every override names a known category.
    pub fn validate(&self) -> Result<()> {
        if self.store.sweep_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "store.sweep_interval_secs must be positive".to_string(),
            ));
        }
        if self.store.max_keys == 0 {
            return Err(TurnstileError::Config(
                "store.max_keys must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.adaptive.load_threshold) {
            return Err(TurnstileError::Config(format!(
                "adaptive.load_threshold must be within [0, 1], got {}",
                self.adaptive.load_threshold
            )));
        }
        if !(self.adaptive.scale_factor > 0.0 && self.adaptive.scale_factor <= 1.0) {
            return Err(TurnstileError::Config(format!(
                "adaptive.scale_factor must be within (0, 1], got {}",
                self.adaptive.scale_factor
            )));
        }
        for name in self.policies.keys() {
            name.parse::<Category>()?;
        }
        Ok(())
    }

    /// The override for `category`, if one was configured.
    ///
    /// Names match case-insensitively since environment sources lowercase
    /// keys.
    pub fn policy_override(&self, category: Category) -> Option<&PolicyOverride> {
        self.policies
            .iter()
            .find(|(name, _)| name.parse::<Category>().ok() == Some(category))
            .map(|(_, policy)| policy)
    }

    /// Whether `category` should be wrapped in an adaptive limiter.
    pub fn adaptive_for(&self, category: Category) -> bool {
        self.policy_override(category)
            .and_then(|o| o.adaptive)
            .unwrap_or(self.adaptive.enabled)
    }
}
