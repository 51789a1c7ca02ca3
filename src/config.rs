// src/config.rs
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::RelayError;
use crate::topology::Topology;

pub const CONFIG_FILE_NAME: &str = "fakedata.json";

// Configuration structures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub rabbitmq: RabbitConfig,
    #[serde(default = "default_filename")]
    pub filename: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RabbitConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Interval between connection attempts.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub queries: QueriesConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueriesConfig {
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
}

// Default values suitable for a vanilla RabbitMQ container
fn default_hostname() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5672 }
fn default_username() -> String { "guest".to_string() }
fn default_password() -> String { "guest".to_string() }
fn default_vhost() -> String { "/".to_string() }
fn default_timeout_ms() -> u64 { 5000 }
fn default_filename() -> PathBuf { PathBuf::from("data.json") }
fn default_exchange() -> String { "queries".to_string() }
fn default_queue() -> String { "fakedata.queries".to_string() }
fn default_routing_key() -> String { "#".to_string() }

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            rabbitmq: RabbitConfig::default(),
            filename: default_filename(),
        }
    }
}

impl Default for RabbitConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: default_port(),
            username: default_username(),
            password: default_password(),
            vhost: default_vhost(),
            timeout_ms: default_timeout_ms(),
            queries: QueriesConfig::default(),
        }
    }
}

impl Default for QueriesConfig {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            queue: default_queue(),
            routing_key: default_routing_key(),
        }
    }
}

pub fn find_config_file() -> Option<PathBuf> {
    let locations = [
        ("Current directory", PathBuf::from(CONFIG_FILE_NAME)),
        ("Current directory (config/)", Path::new("config").join(CONFIG_FILE_NAME)),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Some(path.clone());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Some(home_config);
        }
    }

    None
}

impl RelayConfig {
    /// Defaults, then the config file if one is found, then `.env` and
    /// environment overrides.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match find_config_file() {
            Some(path) => Self::from_file(&path)?,
            None => {
                info!("No configuration file loaded - using defaults");
                Self::default()
            }
        };

        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file at {}", path.display()))?;

        let config: RelayConfig = serde_json::from_str(&content)
            .context("Configuration file contains invalid JSON")?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply `FAKEDATA_*` overrides obtained through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rabbitmq = &mut self.rabbitmq;

        if let Some(value) = lookup("FAKEDATA_RABBITMQ_HOSTNAME") {
            rabbitmq.hostname = value;
        }
        if let Some(value) = lookup("FAKEDATA_RABBITMQ_PORT") {
            rabbitmq.port = value.trim().parse().map_err(|e| {
                RelayError::Config(format!("FAKEDATA_RABBITMQ_PORT '{}': {}", value, e))
            })?;
        }
        if let Some(value) = lookup("FAKEDATA_RABBITMQ_USERNAME") {
            rabbitmq.username = value;
        }
        if let Some(value) = lookup("FAKEDATA_RABBITMQ_PASSWORD") {
            rabbitmq.password = value;
        }
        if let Some(value) = lookup("FAKEDATA_RABBITMQ_VHOST") {
            rabbitmq.vhost = value;
        }
        if let Some(value) = lookup("FAKEDATA_RABBITMQ_TIMEOUT") {
            let timeout = parse_duration(&value).ok_or_else(|| {
                RelayError::Config(format!("FAKEDATA_RABBITMQ_TIMEOUT '{}' is not a duration", value))
            })?;
            rabbitmq.timeout_ms = timeout.as_millis() as u64;
        }
        if let Some(value) = lookup("FAKEDATA_RABBITMQ_QUERIES_EXCHANGE") {
            rabbitmq.queries.exchange = value;
        }
        if let Some(value) = lookup("FAKEDATA_RABBITMQ_QUERIES_QUEUE") {
            rabbitmq.queries.queue = value;
        }
        if let Some(value) = lookup("FAKEDATA_RABBITMQ_QUERIES_ROUTINGKEY") {
            rabbitmq.queries.routing_key = value;
        }
        if let Some(value) = lookup("FAKEDATA_FILENAME") {
            self.filename = PathBuf::from(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.rabbitmq.hostname.is_empty() {
            return Err(RelayError::Config("rabbitmq.hostname cannot be empty".to_string()));
        }
        if self.rabbitmq.port == 0 {
            return Err(RelayError::Config("rabbitmq.port cannot be 0".to_string()));
        }
        if self.rabbitmq.timeout_ms == 0 {
            return Err(RelayError::Config("rabbitmq.timeout_ms must be positive".to_string()));
        }
        if self.rabbitmq.queries.exchange.is_empty() {
            return Err(RelayError::Config(
                "rabbitmq.queries.exchange cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.rabbitmq.timeout_ms)
    }

    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}",
            encode_component(&self.rabbitmq.username),
            encode_component(&self.rabbitmq.password),
            self.endpoint()
        )
    }

    /// Broker address without credentials.
    pub fn endpoint(&self) -> String {
        format!(
            "{}:{}/{}",
            self.rabbitmq.hostname,
            self.rabbitmq.port,
            encode_component(&self.rabbitmq.vhost)
        )
    }

    pub fn topology(&self) -> Topology {
        Topology {
            exchange: self.rabbitmq.queries.exchange.clone(),
            queue: self.rabbitmq.queries.queue.clone(),
            routing_key: self.rabbitmq.queries.routing_key.clone(),
        }
    }
}

/// Parse `250ms`, `5s`, `2m` or a bare number of seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (amount, unit) = value.split_at(split);
    let amount: u64 = amount.parse().ok()?;

    match unit.trim() {
        "" | "s" => Some(Duration::from_secs(amount)),
        "ms" => Some(Duration::from_millis(amount)),
        "m" => Some(Duration::from_secs(amount * 60)),
        _ => None,
    }
}

// Percent-encode the characters that would change the meaning of an AMQP URI.
fn encode_component(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => encoded.push_str("%25"),
            '/' => encoded.push_str("%2f"),
            ':' => encoded.push_str("%3a"),
            '@' => encoded.push_str("%40"),
            '?' => encoded.push_str("%3f"),
            '#' => encoded.push_str("%23"),
            other => encoded.push(other),
        }
    }
    encoded
}
