//! Service configuration.
//!
//! Loaded in the following order (later sources override earlier):
//! 1. Default values
//! 2. `switchyard.toml` in the current directory (if present)
//! 3. The file passed with `--config` (if any)
//! 4. The legacy `DEPLOYMENT_CODE` and `SERVICE_CODE` variables
//! 5. Environment variables with the `SWITCHYARD_` prefix, nested with `__`
//!    (`SWITCHYARD_RPC__CLIENT__DEFAULT_TIMEOUT=2.5`)

use std::path::PathBuf;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use switchyard_broker::BrokerConfig;
use switchyard_rpc::RpcConfig;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub topology: TopologySettings,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub rpc: RpcConfig,
}

impl AppConfig {
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        Self::figment(path).extract().map_err(ConfigError::from)
    }

    fn figment(path: Option<&str>) -> Figment {
        let mut figment = Figment::new().merge(Toml::file("switchyard.toml"));

        if let Some(p) = path {
            figment = figment.merge(Toml::file(p));
        }

        figment
            .merge(
                Env::raw()
                    .only(&["DEPLOYMENT_CODE", "SERVICE_CODE"])
                    .map(|key| format!("topology.{}", key.as_str().to_ascii_lowercase()).into()),
            )
            .merge(Env::prefixed("SWITCHYARD_").split("__"))
    }
}

/// Where the topology document lives and which service this process is.
#[derive(Debug, Clone, Deserialize)]
pub struct TopologySettings {
    /// Directory holding `<deployment_code>.idep` documents.
    #[serde(default = "default_topology_dir")]
    pub dir: PathBuf,

    #[serde(default)]
    pub deployment_code: Option<String>,

    #[serde(default)]
    pub service_code: Option<String>,
}

impl Default for TopologySettings {
    fn default() -> Self {
        Self {
            dir: default_topology_dir(),
            deployment_code: None,
            service_code: None,
        }
    }
}

impl TopologySettings {
    pub fn deployment_code(&self) -> Result<&str, ConfigError> {
        non_empty(self.deployment_code.as_deref())
            .ok_or_else(|| ConfigError::Invalid("topology.deployment_code is not set".to_string()))
    }

    pub fn service_code(&self) -> Result<&str, ConfigError> {
        non_empty(self.service_code.as_deref())
            .ok_or_else(|| ConfigError::Invalid("topology.service_code is not set".to_string()))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn default_topology_dir() -> PathBuf {
    PathBuf::from("config")
}
