//! Configuration loading
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. TOML file (`TEMPO_CONFIG_PATH`, or `tempo.toml` in the working directory)
//! 3. `TEMPO__SECTION__KEY` environment variables
//! 4. `TEMPO_DATABASE_URL`
//! 5. Explicit builder overrides (CLI flags, embedding code)
//!
//! A `.env` file is loaded first if present.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::retry::RetryPolicy;

const DEFAULT_CONFIG_FILE: &str = "tempo.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub runtime: RuntimeConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_secs: 10,
            idle_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Deepest allowed nesting of `rpc` calls; top-level executions have depth 0
    pub max_depth: u32,
    /// Timers fired per sweep
    pub timer_batch_size: usize,
    /// How often the worker looks for due timers
    pub sweep_interval_ms: u64,
    /// Executions advanced in parallel by one worker
    pub worker_concurrency: usize,
    /// How long a runtime's claim on an execution lasts without renewal.
    /// Claims are renewed at a third of this while an advance runs.
    pub claim_lease_ms: u64,
    /// Retry interval while another runtime holds the claim
    pub claim_poll_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_depth: 64,
            timer_batch_size: 100,
            sweep_interval_ms: 1000,
            worker_concurrency: 16,
            claim_lease_ms: 30_000,
            claim_poll_ms: 50,
        }
    }
}

/// Retry policy per step kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Side-effect calls
    pub run: RetryPolicy,
    /// Dispatching nested invocations
    pub rpc: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            run: RetryPolicy::default(),
            rpc: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from all sources
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Database URL, failing with a readable message when none is configured
    pub fn database_url(&self) -> Result<&str> {
        self.database.url.as_deref().context(
            "No database URL configured. Set TEMPO_DATABASE_URL, pass --database-url, \
             or add [database] url to tempo.toml",
        )
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    database_url: Option<String>,
    config_path: Option<PathBuf>,
}

impl ConfigBuilder {
    pub fn database_url(mut self, url: Option<String>) -> Self {
        self.database_url = url;
        self
    }

    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn build(self) -> Result<Config> {
        dotenvy::dotenv().ok();

        let explicit_path = self
            .config_path
            .or_else(|| env::var("TEMPO_CONFIG_PATH").ok().map(PathBuf::from));

        let mut builder = config::Config::builder();

        builder = match &explicit_path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                builder.add_source(config::File::from(path.as_path()).required(true))
            }
            None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        builder = builder
            .add_source(
                config::Environment::with_prefix("TEMPO")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .set_override_option("database.url", env::var("TEMPO_DATABASE_URL").ok())
            .context("Invalid TEMPO_DATABASE_URL")?
            .set_override_option("database.url", self.database_url)
            .context("Invalid database URL override")?;

        let config: Config = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.runtime.worker_concurrency == 0 {
            anyhow::bail!("runtime.worker_concurrency must be at least 1");
        }
        if self.runtime.claim_lease_ms < 3 {
            anyhow::bail!("runtime.claim_lease_ms must be at least 3");
        }
        if self.runtime.timer_batch_size == 0 {
            anyhow::bail!("runtime.timer_batch_size must be at least 1");
        }
        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "database.min_connections ({}) exceeds database.max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }
        Ok(())
    }
}
