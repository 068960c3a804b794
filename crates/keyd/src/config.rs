//! Configuration loading and validation for the key daemon.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any variable is present but invalid.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::TimeDelta;
use common::Feature;
use serde::Deserialize;

/// Validated daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// How long (seconds) a key signs before the rotator replaces it.
    #[serde(default = "default_key_duration")]
    pub key_duration_secs: u64,

    /// How often (seconds) the rotator runs a pass.
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval_secs: u64,

    /// How often (seconds) caches refresh their key sets.
    #[serde(default = "default_cache_refresh_interval")]
    pub cache_refresh_interval_secs: u64,

    /// Comma-separated feature names the rotator manages. Empty means all.
    #[serde(default)]
    pub rotator_features: String,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// OTLP endpoint of an OTEL collector. Span export is off when unset.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,
}

/// Upper bound on every duration setting: 100 years.
const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn default_key_duration() -> u64 {
    30 * 24 * 60 * 60
}
fn default_rotation_interval() -> u64 {
    600
}
fn default_cache_refresh_interval() -> u64 {
    600
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable cannot be parsed or fails validation.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        if self.key_duration_secs <= 3600 {
            anyhow::bail!("KEY_DURATION_SECS must be longer than one hour");
        }
        if self.rotation_interval_secs == 0 {
            anyhow::bail!("ROTATION_INTERVAL_SECS must be > 0");
        }
        if self.cache_refresh_interval_secs == 0 {
            anyhow::bail!("CACHE_REFRESH_INTERVAL_SECS must be > 0");
        }
        for (name, secs) in [
            ("KEY_DURATION_SECS", self.key_duration_secs),
            ("ROTATION_INTERVAL_SECS", self.rotation_interval_secs),
            ("CACHE_REFRESH_INTERVAL_SECS", self.cache_refresh_interval_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                anyhow::bail!("{name} must be at most {MAX_DURATION_SECS} (100 years)");
            }
        }
        self.features().context("ROTATOR_FEATURES is invalid")?;
        Ok(())
    }

    /// Features named by `ROTATOR_FEATURES`, or every feature when unset.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first unknown feature.
    pub fn features(&self) -> Result<Vec<Feature>> {
        let mut features = Vec::new();
        for name in self
            .rotator_features
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
        {
            let feature: Feature = name.parse()?;
            if !features.contains(&feature) {
                features.push(feature);
            }
        }
        if features.is_empty() {
            features = Feature::ALL.to_vec();
        }
        Ok(features)
    }

    pub fn key_duration(&self) -> TimeDelta {
        TimeDelta::seconds(self.key_duration_secs.min(MAX_DURATION_SECS) as i64)
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn cache_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.cache_refresh_interval_secs)
    }
}
