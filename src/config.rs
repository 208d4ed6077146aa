//! Configuration loading from TOML with environment variable overrides.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. The
//! service's deployment variables (`DATABASE_URI`,
//! `ACCRUAL_SYSTEM_ADDRESS`) take precedence over the file, so containers
//! can run with the stock config and only set the environment.

use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "GOPHERMART_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

const DATABASE_URI_ENV: &str = "DATABASE_URI";
const ACCRUAL_ADDRESS_ENV: &str = "ACCRUAL_SYSTEM_ADDRESS";

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub accrual: AccrualConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineSettings {
    /// Seconds between pending-order discovery ticks.
    pub poll_interval_secs: u64,
    /// Worker count; 0 sizes the pool from available parallelism.
    pub workers: usize,
    /// Capacity of the queue between poller and workers.
    pub queue_capacity: usize,
}

impl EngineSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            workers: 0,
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AccrualConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Backoff used when a 429 response has no `Retry-After`.
    pub default_retry_after_secs: u64,
}

impl Default for AccrualConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            request_timeout_secs: 10,
            default_retry_after_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx SQLite URI, e.g. `sqlite://gophermart.db`. May embed
    /// credentials on other backends, so it is never logged.
    pub uri: SecretString,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            uri: SecretString::new(String::new()),
            max_connections: 8,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Load the file named by `GOPHERMART_CONFIG` (default `config.toml`),
    /// falling back to defaults when it does not exist, then apply
    /// environment overrides and validate.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = if std::path::Path::new(&path).exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply deployment overrides. `lookup` resolves a variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(uri) = lookup(DATABASE_URI_ENV).filter(|v| !v.is_empty()) {
            self.database.uri = SecretString::new(uri);
        }
        if let Some(addr) = lookup(ACCRUAL_ADDRESS_ENV).filter(|v| !v.is_empty()) {
            self.accrual.base_url = addr;
        }
    }

    /// Reject configurations the engine cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.database.uri.expose_secret().trim().is_empty() {
            anyhow::bail!("Database URI is not configured (set {DATABASE_URI_ENV} or [database].uri)");
        }
        if self.accrual.base_url.trim().is_empty() {
            anyhow::bail!(
                "Accrual system address is not configured (set {ACCRUAL_ADDRESS_ENV} or [accrual].base_url)"
            );
        }
        if self.engine.poll_interval_secs == 0 {
            anyhow::bail!("engine.poll_interval_secs must be positive");
        }
        if self.engine.queue_capacity == 0 {
            anyhow::bail!("engine.queue_capacity must be positive");
        }
        Ok(())
    }
}
