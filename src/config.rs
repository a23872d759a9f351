// src/config.rs

//! Manages client configuration: loading, resolving the environment-specific
//! endpoint, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Overrides `environment` from the config file.
pub const ENV_ENVIRONMENT: &str = "ORDERFEED_ENV";
/// Supplies the session encryption key when the file does not.
pub const ENV_SESSION_KEY: &str = "ORDERFEED_SESSION_KEY";

/// Which backend deployment the client talks to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(anyhow!(
                "unknown environment '{other}' (expected 'development' or 'production')"
            )),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => f.write_str("development"),
            Environment::Production => f.write_str("production"),
        }
    }
}

/// The realtime endpoint for each environment.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EndpointsConfig {
    #[serde(default = "default_development_endpoint")]
    pub development: String,
    #[serde(default = "default_production_endpoint")]
    pub production: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            development: default_development_endpoint(),
            production: default_production_endpoint(),
        }
    }
}

fn default_development_endpoint() -> String {
    "ws://localhost:8080/ws".to_string()
}
fn default_production_endpoint() -> String {
    "wss://api.example.com/ws".to_string()
}

/// Where the encrypted session lives and how to open it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_cookie_file")]
    pub cookie_file: String,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Base64 AES-256 key. Falls back to `ORDERFEED_SESSION_KEY`.
    #[serde(default, skip_serializing)]
    pub encryption_key: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_file: default_cookie_file(),
            cookie_name: default_cookie_name(),
            encryption_key: None,
        }
    }
}

fn default_cookie_file() -> String {
    "session.cookies".to_string()
}
fn default_cookie_name() -> String {
    "session".to_string()
}

/// Heart-beat intervals declared in the CONNECT frame. `0s` disables a direction.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HeartbeatConfig {
    #[serde(with = "humantime_serde", default = "default_heartbeat")]
    pub outgoing: Duration,
    #[serde(with = "humantime_serde", default = "default_heartbeat")]
    pub incoming: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            outgoing: default_heartbeat(),
            incoming: default_heartbeat(),
        }
    }
}

fn default_heartbeat() -> Duration {
    Duration::from_secs(4)
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_enabled")]
    pub enabled: bool,
    #[serde(with = "humantime_serde", default = "default_reconnect_delay")]
    pub delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: default_reconnect_enabled(),
            delay: default_reconnect_delay(),
        }
    }
}

fn default_reconnect_enabled() -> bool {
    true
}
fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

/// A raw representation of the config file before resolution and validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    environment: Environment,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    endpoints: EndpointsConfig,
    #[serde(default)]
    session: SessionConfig,
    #[serde(default)]
    heartbeat: HeartbeatConfig,
    #[serde(default)]
    reconnect: ReconnectConfig,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    connect_timeout: Duration,
}

/// Represents the final, validated, and resolved client configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub environment: Environment,
    pub log_level: String,
    pub endpoints: EndpointsConfig,
    /// The endpoint of the selected environment, parsed.
    pub endpoint: Url,
    pub session: SessionConfig,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let endpoints = EndpointsConfig::default();
        let endpoint = Url::parse(&endpoints.development)
            .unwrap_or_else(|_| unreachable!("default endpoint is a valid URL"));
        Self {
            environment: Environment::default(),
            log_level: default_log_level(),
            endpoints,
            endpoint,
            session: SessionConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Config {
    /// Creates a new `Config` by reading and parsing a TOML file, applying
    /// environment variable overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw_config: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let env_override = std::env::var(ENV_ENVIRONMENT).ok();
        let key_fallback = std::env::var(ENV_SESSION_KEY).ok();
        Self::resolve(raw_config, env_override.as_deref(), key_fallback)
    }

    /// Parses a TOML document without consulting the process environment.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let raw_config: RawConfig =
            toml::from_str(contents).context("Failed to parse configuration TOML")?;
        Self::resolve(raw_config, None, None)
    }

    fn resolve(
        raw_config: RawConfig,
        env_override: Option<&str>,
        key_fallback: Option<String>,
    ) -> Result<Self> {
        let environment = match env_override {
            Some(value) => {
                let environment = value
                    .parse::<Environment>()
                    .with_context(|| format!("Invalid {ENV_ENVIRONMENT}"))?;
                info!("Environment overridden to '{}' by {}.", environment, ENV_ENVIRONMENT);
                environment
            }
            None => raw_config.environment,
        };

        let raw_endpoint = match environment {
            Environment::Development => &raw_config.endpoints.development,
            Environment::Production => &raw_config.endpoints.production,
        };
        let endpoint = Url::parse(raw_endpoint)
            .with_context(|| format!("Invalid {environment} endpoint '{raw_endpoint}'"))?;

        let mut session = raw_config.session;
        if session.encryption_key.is_none() {
            session.encryption_key = key_fallback;
        }

        let config = Config {
            environment,
            log_level: raw_config.log_level,
            endpoints: raw_config.endpoints,
            endpoint,
            session,
            heartbeat: raw_config.heartbeat,
            reconnect: raw_config.reconnect,
            connect_timeout: raw_config.connect_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        match self.endpoint.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(anyhow!(
                    "endpoint '{}' must use ws or wss, not '{other}'",
                    self.endpoint
                ));
            }
        }
        if self.endpoint.host_str().is_none() {
            return Err(anyhow!("endpoint '{}' has no host", self.endpoint));
        }
        if self.environment == Environment::Production && self.endpoint.scheme() == "ws" {
            warn!(
                "Production endpoint '{}' is not encrypted (ws://).",
                self.endpoint
            );
        }
        if self.connect_timeout.is_zero() {
            return Err(anyhow!("connect_timeout cannot be 0"));
        }
        if self.reconnect.enabled && self.reconnect.delay.is_zero() {
            return Err(anyhow!("reconnect.delay cannot be 0 when reconnect is enabled"));
        }
        if self.session.cookie_name.trim().is_empty() {
            return Err(anyhow!("session.cookie_name cannot be empty"));
        }
        if self.session.cookie_file.trim().is_empty() {
            return Err(anyhow!("session.cookie_file cannot be empty"));
        }
        Ok(())
    }
}
