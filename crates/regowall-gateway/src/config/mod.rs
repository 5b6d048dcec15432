//! Gateway config loader (strict parsing).

pub mod schema;

use std::fs;

use regowall_core::error::{RegowallError, Result};

pub use schema::{
    ChannelSection, Credentials, GatewayConfig, GatewaySection, PoliciesSection,
    ProducerSection, Secret, SecurityProtocol,
};

/// Read `path`, overlay the process environment, validate.
pub fn load_from_file(path: &str) -> Result<GatewayConfig> {
    let s = fs::read_to_string(path)
        .map_err(|e| RegowallError::Config(format!("read config {path} failed: {e}")))?;
    load_with_env(&s, |key| std::env::var(key).ok())
}

/// Parse and validate without consulting the environment.
pub fn load_from_str(s: &str) -> Result<GatewayConfig> {
    load_with_env(s, |_| None)
}

pub fn load_with_env<F>(s: &str, lookup: F) -> Result<GatewayConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg: GatewayConfig = serde_yaml::from_str(s)
        .map_err(|e| RegowallError::Config(format!("invalid yaml: {e}")))?;
    cfg.apply_env(lookup)?;
    cfg.validate()?;
    Ok(cfg)
}
