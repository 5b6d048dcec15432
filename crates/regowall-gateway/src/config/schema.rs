use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use regowall_core::error::{RegowallError, Result};

pub const ENV_BUS_ENDPOINTS: &str = "REGOWALL_BUS_ENDPOINTS";
pub const ENV_SECURITY_PROTOCOL: &str = "REGOWALL_SECURITY_PROTOCOL";
pub const ENV_SASL_MECHANISM: &str = "REGOWALL_SASL_MECHANISM";
pub const ENV_SASL_USERNAME: &str = "REGOWALL_SASL_USERNAME";
pub const ENV_SASL_PASSWORD: &str = "REGOWALL_SASL_PASSWORD";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub version: u32,

    #[serde(default)]
    pub gateway: GatewaySection,

    #[serde(default)]
    pub policies: PoliciesSection,

    #[serde(default)]
    pub channel: ChannelSection,

    #[serde(default)]
    pub producer: ProducerSection,
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(RegowallError::Config(format!(
                "unsupported config version {}",
                self.version
            )));
        }

        self.gateway.validate()?;
        self.policies.validate()?;
        self.channel.validate()?;
        self.producer.validate()?;

        Ok(())
    }

    /// Overlay bus connection settings from the environment.
    ///
    /// `lookup` is `std::env::var` in production; tests inject a map.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.channel.apply_env(lookup)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewaySection {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl GatewaySection {
    pub fn validate(&self) -> Result<()> {
        self.listen_addr().map(|_| ())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen.parse().map_err(|_| {
            RegowallError::Config(format!(
                "gateway.listen must be a valid socket address, got {:?}",
                self.listen
            ))
        })
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".into()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoliciesSection {
    /// Directory of YAML policy documents applied before consumption starts.
    #[serde(default)]
    pub static_dir: Option<PathBuf>,

    #[serde(default = "default_compile_interval_ms")]
    pub compile_interval_ms: u64,
}

impl Default for PoliciesSection {
    fn default() -> Self {
        Self {
            static_dir: None,
            compile_interval_ms: default_compile_interval_ms(),
        }
    }
}

impl PoliciesSection {
    pub fn validate(&self) -> Result<()> {
        if !(100..=3_600_000).contains(&self.compile_interval_ms) {
            return Err(RegowallError::Config(
                "policies.compile_interval_ms must be between 100 and 3600000".into(),
            ));
        }
        Ok(())
    }
}

fn default_compile_interval_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityProtocol {
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "PLAINTEXT",
            SecurityProtocol::Ssl => "SSL",
            SecurityProtocol::SaslPlaintext => "SASL_PLAINTEXT",
            SecurityProtocol::SaslSsl => "SASL_SSL",
        }
    }
}

impl FromStr for SecurityProtocol {
    type Err = RegowallError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PLAINTEXT" => Ok(SecurityProtocol::Plaintext),
            "SSL" => Ok(SecurityProtocol::Ssl),
            "SASL_PLAINTEXT" => Ok(SecurityProtocol::SaslPlaintext),
            "SASL_SSL" => Ok(SecurityProtocol::SaslSsl),
            other => Err(RegowallError::Config(format!(
                "unknown security protocol {other:?}"
            ))),
        }
    }
}

/// String that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Secret,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelSection {
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Consumer group of this enforcement process.
    #[serde(default = "default_group")]
    pub group: String,

    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Records kept per partition before the low watermark advances.
    #[serde(default = "default_retention")]
    pub retention: usize,

    #[serde(default)]
    pub endpoints: Vec<String>,

    #[serde(default = "default_security_protocol")]
    pub security_protocol: SecurityProtocol,

    #[serde(default)]
    pub sasl_mechanism: Option<String>,

    /// Environment only; never read from the file.
    #[serde(skip)]
    pub credentials: Option<Credentials>,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            group: default_group(),
            partitions: default_partitions(),
            retention: default_retention(),
            endpoints: Vec::new(),
            security_protocol: default_security_protocol(),
            sasl_mechanism: None,
            credentials: None,
        }
    }
}

impl ChannelSection {
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(RegowallError::Config("channel.topic must not be empty".into()));
        }
        if self.group.trim().is_empty() {
            return Err(RegowallError::Config("channel.group must not be empty".into()));
        }
        if !(1..=256).contains(&self.partitions) {
            return Err(RegowallError::Config(
                "channel.partitions must be between 1 and 256".into(),
            ));
        }
        if self.retention == 0 {
            return Err(RegowallError::Config(
                "channel.retention must be greater than 0".into(),
            ));
        }
        if self.endpoints.iter().all(|e| e.trim().is_empty()) {
            return Err(RegowallError::Config(format!(
                "no bus endpoints configured (channel.endpoints or {ENV_BUS_ENDPOINTS})"
            )));
        }
        Ok(())
    }

    fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_BUS_ENDPOINTS) {
            self.endpoints = raw
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(raw) = lookup(ENV_SECURITY_PROTOCOL) {
            self.security_protocol = raw.parse()?;
        }
        if let Some(raw) = lookup(ENV_SASL_MECHANISM) {
            self.sasl_mechanism = Some(raw.trim().to_string()).filter(|m| !m.is_empty());
        }

        let username = lookup(ENV_SASL_USERNAME).filter(|u| !u.is_empty());
        let password = lookup(ENV_SASL_PASSWORD).filter(|p| !p.is_empty());
        self.credentials = match (username, password) {
            (Some(username), Some(password)) => Some(Credentials {
                username,
                password: Secret::new(password),
            }),
            _ => None,
        };

        if self.credentials.is_none() && self.security_protocol != SecurityProtocol::Plaintext {
            tracing::warn!(
                requested = self.security_protocol.as_str(),
                "bus credentials missing, falling back to PLAINTEXT"
            );
            self.security_protocol = SecurityProtocol::Plaintext;
            self.sasl_mechanism = None;
        }
        Ok(())
    }
}

fn default_topic() -> String {
    "firewall-policies".into()
}
fn default_group() -> String {
    "regowall".into()
}
fn default_partitions() -> u32 {
    4
}
fn default_retention() -> usize {
    100_000
}
fn default_security_protocol() -> SecurityProtocol {
    SecurityProtocol::Plaintext
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProducerSection {
    #[serde(default)]
    pub enabled: bool,

    /// NDJSON access log replayed through the producers at startup.
    #[serde(default)]
    pub ingress_log: Option<PathBuf>,

    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    #[serde(default = "default_block_duration_secs")]
    pub block_duration_secs: u64,

    #[serde(default = "default_rate_per_sec")]
    pub rate_per_sec: f64,

    #[serde(default = "default_burst")]
    pub burst: u32,

    #[serde(default = "default_host_prefixes")]
    pub host_prefixes: Vec<String>,
}

impl Default for ProducerSection {
    fn default() -> Self {
        Self {
            enabled: false,
            ingress_log: None,
            sync_interval_ms: default_sync_interval_ms(),
            block_duration_secs: default_block_duration_secs(),
            rate_per_sec: default_rate_per_sec(),
            burst: default_burst(),
            host_prefixes: default_host_prefixes(),
        }
    }
}

impl ProducerSection {
    pub fn validate(&self) -> Result<()> {
        if !(1_000..=3_600_000).contains(&self.sync_interval_ms) {
            return Err(RegowallError::Config(
                "producer.sync_interval_ms must be between 1000 and 3600000".into(),
            ));
        }
        if self.block_duration_secs == 0 {
            return Err(RegowallError::Config(
                "producer.block_duration_secs must be greater than 0".into(),
            ));
        }
        if !(self.rate_per_sec.is_finite() && self.rate_per_sec > 0.0) {
            return Err(RegowallError::Config(
                "producer.rate_per_sec must be a positive number".into(),
            ));
        }
        if self.burst == 0 {
            return Err(RegowallError::Config("producer.burst must be at least 1".into()));
        }
        if self.host_prefixes.iter().any(|p| p.trim().is_empty()) {
            return Err(RegowallError::Config(
                "producer.host_prefixes must not contain empty entries".into(),
            ));
        }
        Ok(())
    }
}

fn default_sync_interval_ms() -> u64 {
    15_000
}
fn default_block_duration_secs() -> u64 {
    24 * 60 * 60
}
fn default_rate_per_sec() -> f64 {
    0.5
}
fn default_burst() -> u32 {
    1
}
fn default_host_prefixes() -> Vec<String> {
    vec!["www.".into(), "activities.".into()]
}
