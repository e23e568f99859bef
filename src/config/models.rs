// src/config/models.rs
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Endpoints monitored by the binary, as `host[:port]`.
    #[serde(default)]
    pub endpoints: Vec<String>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.health_check.validate()?;
        for endpoint in &self.endpoints {
            if endpoint.parse::<crate::endpoint::Endpoint>().is_err() {
                bail!("Invalid endpoint in configuration: {:?}", endpoint);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionProtocol {
    #[default]
    Http,
    Https,
}

impl SessionProtocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            SessionProtocol::Http => "http",
            SessionProtocol::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            SessionProtocol::Http => 80,
            SessionProtocol::Https => 443,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub protocol: SessionProtocol,
    /// Probe port; 0 means the endpoint's own port.
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            path: default_path(),
            protocol: SessionProtocol::default(),
            port: 0,
            retry: RetryConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            bail!("health_check.interval_ms must be greater than zero");
        }
        if self.timeout_ms == 0 {
            bail!("health_check.timeout_ms must be greater than zero");
        }
        if !self.path.starts_with('/') {
            bail!("health_check.path must start with '/': {:?}", self.path);
        }
        self.retry.validate()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Fraction of each delay added as random jitter, in [0, 1].
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backoff_base_ms > self.backoff_max_ms {
            bail!(
                "retry.backoff_base_ms ({}) exceeds retry.backoff_max_ms ({})",
                self.backoff_base_ms,
                self.backoff_max_ms
            );
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            bail!("retry.jitter must be within [0, 1], got {}", self.jitter);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_interval_ms() -> u64 {
    3_000
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_path() -> String {
    "/health".to_string()
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

fn default_jitter() -> f64 {
    0.2
}
