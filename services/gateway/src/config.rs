//! Gateway configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/hermod/gateway.toml`.
//!
//! # Required fields
//! - `service_id`
//! - `listen`
//! - `naming_url`

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/hermod/gateway.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {0}: {1}")]
    Read(String, std::io::Error),
    #[error("parse {0}: {1}")]
    Parse(String, toml::de::Error),
    #[error("missing required field: {0}")]
    Missing(&'static str),
}

/// Validated gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub service_id: String,
    pub service_name: String,
    /// Edge listen address, e.g. `0.0.0.0:8000`.
    pub listen: String,
    /// Address advertised to the naming registry; empty skips registration.
    pub public_address: String,
    pub public_port: u16,
    pub tags: Vec<String>,
    /// Naming agent URL, e.g. `http://127.0.0.1:8500`.
    pub naming_url: String,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    service_id: Option<String>,
    service_name: Option<String>,
    listen: Option<String>,
    public_address: Option<String>,
    public_port: Option<u16>,
    tags: Option<Vec<String>>,
    naming_url: Option<String>,
}

pub fn load_config_from(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
    let raw: RawConfig =
        toml::from_str(&text).map_err(|e| ConfigError::Parse(path.display().to_string(), e))?;

    Ok(GatewayConfig {
        service_id: raw.service_id.ok_or(ConfigError::Missing("service_id"))?,
        service_name: raw.service_name.unwrap_or_else(|| "gateway".to_owned()),
        listen: raw.listen.ok_or(ConfigError::Missing("listen"))?,
        public_address: raw.public_address.unwrap_or_default(),
        public_port: raw.public_port.unwrap_or_default(),
        tags: raw.tags.unwrap_or_default(),
        naming_url: raw.naming_url.ok_or(ConfigError::Missing("naming_url"))?,
    })
}
