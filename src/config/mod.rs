//! Typed settings for running bulks, from environment variables or TOML.
//!
//! Loads once at startup and fails fast on malformed values. The library
//! itself only needs a [`BulkConfig`](crate::bulk::BulkConfig); these
//! settings feed the binary and anyone embedding the driver who wants the
//! same knobs.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const ENV_MAX_WORK_PER_TX: &str = "TXBULK_MAX_WORK_PER_TX";
pub const ENV_LOCALITIES: &str = "TXBULK_LOCALITIES";
pub const ENV_OTEL_ENDPOINT: &str = "OTEL_ENDPOINT";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

pub const DEFAULT_MAX_WORK_PER_TX: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Maximum number of items executed in one transaction.
    pub max_work_per_tx: u32,
    /// Number of localities (workers). `None` means one per available CPU.
    pub localities: Option<usize>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_work_per_tx: DEFAULT_MAX_WORK_PER_TX,
            localities: None,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from environment variables, falling back to defaults.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();
        if let Some(n) = parsed_var::<u32>(ENV_MAX_WORK_PER_TX)? {
            settings.max_work_per_tx = n;
        }
        if let Some(n) = parsed_var::<usize>(ENV_LOCALITIES)? {
            settings.localities = Some(n);
        }
        settings.otel_endpoint = std::env::var(ENV_OTEL_ENDPOINT).ok();
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            settings.log_level = level;
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file. Missing keys take their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad settings {}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_work_per_tx == 0 {
            return Err(Error::Config(
                "max_work_per_tx must be at least 1".to_string(),
            ));
        }
        if self.localities == Some(0) {
            return Err(Error::Config("localities must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("environment variable {name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
