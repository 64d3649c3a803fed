//! Configuration loading
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. A TOML file: the explicit path, else `PARLEY_CONFIG_PATH`, else `./parley.toml` if present
//! 3. `PARLEY_*` environment variables, `__` separating sections (`PARLEY_DISPATCH__ROOT_DIALOG`)
//! 4. `PARLEY_DATABASE_URL`
//! 5. Builder overrides (CLI flags)
//!
//! A `.env` file in the working directory is read before any of this.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::dispatch::DispatchConfig;
use crate::engine::EngineConfig;

pub const CONFIG_PATH_ENV: &str = "PARLEY_CONFIG_PATH";
pub const DATABASE_URL_ENV: &str = "PARLEY_DATABASE_URL";
const DEFAULT_CONFIG_FILE: &str = "parley.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub dispatch: DispatchConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 20,
            min_connections: 2,
            acquire_timeout_secs: 10,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }
}

/// Where conversation state lives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process memory; state is lost on exit
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "parley_core=info".to_string(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load from the default sources with no overrides
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }

    /// Render as TOML, e.g. to seed a config file
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration as TOML")
    }

    fn validate(&self) -> Result<()> {
        if self.storage.backend == StorageBackend::Postgres && self.database.url.is_none() {
            bail!(
                "Postgres storage requires a database URL (set {} or database.url)",
                DATABASE_URL_ENV
            );
        }
        if self.engine.max_steps == 0 {
            bail!("engine.max_steps must be at least 1");
        }
        if let Some(ttl) = self.dispatch.conversation_ttl_secs {
            if ttl == 0 {
                bail!("dispatch.conversation_ttl_secs must be at least 1 (omit it to never expire)");
            }
            let representable = i64::try_from(ttl)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .is_some();
            if !representable {
                bail!(
                    "dispatch.conversation_ttl_secs ({}) is too large (omit it to never expire)",
                    ttl
                );
            }
        }
        if self.dispatch.root_dialog.trim().is_empty() {
            bail!("dispatch.root_dialog must not be empty");
        }
        if self.database.min_connections > self.database.max_connections {
            bail!(
                "database.min_connections ({}) exceeds database.max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    database_url: Option<String>,
    config_path: Option<PathBuf>,
}

impl ConfigBuilder {
    /// Overrides every other source of the database URL
    pub fn database_url(mut self, url: Option<String>) -> Self {
        self.database_url = url;
        self
    }

    /// Read this file instead of searching; it must exist
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn build(self) -> Result<Config> {
        dotenvy::dotenv().ok();

        let mut builder = ::config::Config::builder();

        if let Some((path, required)) = self.file() {
            builder = builder.add_source(::config::File::from(path).required(required));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("PARLEY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: Config = builder
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize()
            .context("Invalid configuration")?;

        if let Ok(url) = env::var(DATABASE_URL_ENV) {
            config.database.url = Some(url);
        }
        if let Some(url) = self.database_url {
            config.database.url = Some(url);
        }

        config.validate()?;
        Ok(config)
    }

    /// The file to read and whether it must exist
    fn file(&self) -> Option<(PathBuf, bool)> {
        if let Some(path) = &self.config_path {
            return Some((path.clone(), true));
        }
        if let Ok(path) = env::var(CONFIG_PATH_ENV) {
            return Some((PathBuf::from(path), true));
        }
        let default = Path::new(DEFAULT_CONFIG_FILE);
        default.exists().then(|| (default.to_path_buf(), false))
    }
}
