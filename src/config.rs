//! Layered settings: built-in defaults, an optional `config/stockpost` file,
//! then `STOCKPOST__*` environment variables.
use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::error::StoreError;
use crate::storage::Storage;

pub const CONFIG_FILE: &str = "config/stockpost";
pub const ENV_PREFIX: &str = "STOCKPOST";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DatabaseSettings {
    pub path: PathBuf,
    #[serde(default)]
    pub temporary: bool,
    pub cache_capacity: u64,
    pub flush_every_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PostingSettings {
    pub sync_on_commit: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub posting: PostingSettings,
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseSettings {
                path: PathBuf::from("stockpost.db"),
                temporary: false,
                cache_capacity: 1024 * 1024 * 1024,
                flush_every_ms: Some(500),
            },
            posting: PostingSettings {
                sync_on_commit: true,
            },
            log: LogSettings {
                level: "info".into(),
                json: false,
            },
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        Self::builder(Some(CONFIG_FILE))?.build()?.try_deserialize()
    }

    /// Defaults and environment only, for callers that ship no config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::builder(None)?.build()?.try_deserialize()
    }

    fn builder(
        file: Option<&str>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        let defaults = Settings::default();
        let mut builder = Config::builder()
            .set_default(
                "database.path",
                defaults.database.path.to_string_lossy().to_string(),
            )?
            .set_default("database.temporary", defaults.database.temporary)?
            .set_default(
                "database.cache_capacity",
                i64::try_from(defaults.database.cache_capacity).unwrap_or(i64::MAX),
            )?
            .set_default("database.flush_every_ms", 500_i64)?
            .set_default("posting.sync_on_commit", defaults.posting.sync_on_commit)?
            .set_default("log.level", defaults.log.level)?
            .set_default("log.json", defaults.log.json)?;

        if let Some(file) = file {
            builder = builder.add_source(File::with_name(file).required(false));
        }

        Ok(builder.add_source(
            Environment::with_prefix(ENV_PREFIX).separator("__"),
        ))
    }

    pub fn sled_config(&self) -> sled::Config {
        sled::Config::new()
            .path(&self.database.path)
            .temporary(self.database.temporary)
            .cache_capacity(self.database.cache_capacity)
            .flush_every_ms(self.database.flush_every_ms)
    }

    pub fn open_storage(&self) -> Result<Storage, StoreError> {
        tracing::debug!(path = %self.database.path.display(), temporary = self.database.temporary, "opening database");
        Storage::from_db(self.sled_config().open()?)
    }
}
