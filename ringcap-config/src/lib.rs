//! # Ringcap Configuration System
//!
//! Layered configuration for the capture host.
//!
//! ## Features
//! - **Layering**: defaults, then YAML files, then `RINGCAP_*` environment variables
//! - **Validation**: every section is checked with `validator` before use

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

mod capture;
mod error;
mod telemetry;
mod validation;

pub use capture::{CaptureConfig, FanoutConfig, RingConfig};
pub use error::ConfigError;
pub use telemetry::TelemetryConfig;

const BASE_FILE: &str = "config/ringcap.yaml";
const ENV_PREFIX: &str = "RINGCAP_";

/// Top-level configuration container.
#[derive(Debug, Serialize, Deserialize, Validate, Default, Clone, PartialEq)]
pub struct RingcapConfig {
    /// AF_PACKET socket and ring parameters.
    #[validate(nested)]
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Logging and metrics.
    #[validate(nested)]
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl RingcapConfig {
    /// Load configuration from default files and environment.
    ///
    /// Hierarchy:
    /// 1. Default values
    /// 2. `config/ringcap.yaml`, skipped when missing
    /// 3. `config/<RINGCAP_ENV>.yaml` (`production` by default)
    /// 4. `RINGCAP_*` environment variables, `__` separating nested keys
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(RingcapConfig::default()));

        if Path::new(BASE_FILE).exists() {
            figment = figment.merge(Yaml::file(BASE_FILE));
        } else {
            debug!("{} not found, using default configuration", BASE_FILE);
        }

        let env = std::env::var("RINGCAP_ENV").unwrap_or_else(|_| "production".into());
        let env_file = format!("config/{}.yaml", env);
        if Path::new(&env_file).exists() {
            figment = figment.merge(Yaml::file(env_file));
        }

        Self::finish(figment)
    }

    /// Load configuration from a specific file, still honouring the environment.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(PathBuf::from(path)));
        }

        let figment =
            Figment::from(Serialized::defaults(RingcapConfig::default())).merge(Yaml::file(path));
        Self::finish(figment)
    }

    fn finish(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }
}
