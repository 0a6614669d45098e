//! Environment configuration
//!
//! Everything is read from the process environment (after loading `.env`).
//! Secrets are parsed once here and never printed: `Config`'s `Debug` output
//! redacts them.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::aggregator::PlaidEnvironment;
use crate::error::EngineError;
use crate::reconciler::DEFAULT_MAX_PAGES;
use crate::vault::{KeyRing, VaultKey};
use crate::Result;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageMode {
    File { data_dir: PathBuf },
    Sqlite { database_url: String },
}

#[derive(Clone)]
pub struct Config {
    pub plaid_env: PlaidEnvironment,
    pub plaid_client_id: String,
    pub plaid_secret: String,
    /// Overrides the host derived from `plaid_env`
    pub plaid_base_url: Option<String>,
    pub key_ring: KeyRing,
    pub storage: StorageMode,
    pub balance_cache_ttl: Duration,
    pub sync_max_pages: u32,
    pub port: u16,
}

impl Config {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &str| {
            get(key).ok_or_else(|| EngineError::Config(format!("{} is required but not set", key)))
        };

        let plaid_env = match get("PLAID_ENV") {
            Some(value) => value.parse()?,
            None => PlaidEnvironment::Sandbox,
        };

        let key_version = parse_number(get("ENCRYPTION_KEY_VERSION"), "ENCRYPTION_KEY_VERSION", 1u32)?;
        let mut key_ring = KeyRing::new(key_version, VaultKey::from_hex(&require("ENCRYPTION_KEY")?)?);
        if let Some(retired) = get("ENCRYPTION_RETIRED_KEYS") {
            for entry in retired.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                let (version, key) = entry.split_once(':').ok_or_else(|| {
                    EngineError::Config(
                        "ENCRYPTION_RETIRED_KEYS entries must look like <version>:<hex key>"
                            .to_string(),
                    )
                })?;
                let version: u32 = version.trim().parse().map_err(|_| {
                    EngineError::Config("retired key version must be a number".to_string())
                })?;
                key_ring = key_ring.with_retired_key(version, VaultKey::from_hex(key)?);
            }
        }

        let storage = match get("STORAGE_MODE")
            .unwrap_or_else(|| "file".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "file" => StorageMode::File {
                data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string())),
            },
            "sqlite" => StorageMode::Sqlite {
                database_url: require("DATABASE_URL")?,
            },
            other => {
                return Err(EngineError::Config(format!(
                    "STORAGE_MODE must be 'file' or 'sqlite', got '{}'",
                    other
                )))
            }
        };

        let port = match get("PORT") {
            Some(port) => parse_number(Some(port), "PORT", DEFAULT_PORT)?,
            None => parse_number(get("API_PORT"), "API_PORT", DEFAULT_PORT)?,
        };

        let config = Self {
            plaid_env,
            plaid_client_id: require("PLAID_CLIENT_ID")?,
            plaid_secret: require("PLAID_SECRET")?,
            plaid_base_url: get("PLAID_BASE_URL"),
            key_ring,
            storage,
            balance_cache_ttl: Duration::from_secs(parse_number(
                get("BALANCE_CACHE_TTL"),
                "BALANCE_CACHE_TTL",
                DEFAULT_CACHE_TTL_SECS,
            )?),
            sync_max_pages: parse_number(get("SYNC_MAX_PAGES"), "SYNC_MAX_PAGES", DEFAULT_MAX_PAGES)?,
            port,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_max_pages == 0 {
            return Err(EngineError::Config(
                "SYNC_MAX_PAGES must be at least 1".to_string(),
            ));
        }
        if let Some(url) = &self.plaid_base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(EngineError::Config(
                    "PLAID_BASE_URL must be an http(s) URL".to_string(),
                ));
            }
        }
        if let StorageMode::Sqlite { database_url } = &self.storage {
            if !database_url.starts_with("sqlite:") {
                return Err(EngineError::Config(
                    "DATABASE_URL must be a sqlite: URL".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn plaid_base_url(&self) -> String {
        self.plaid_base_url
            .clone()
            .unwrap_or_else(|| self.plaid_env.base_url().to_string())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("plaid_env", &self.plaid_env)
            .field("plaid_client_id", &self.plaid_client_id)
            .field("plaid_secret", &"<redacted>")
            .field("plaid_base_url", &self.plaid_base_url)
            .field("active_key_version", &self.key_ring.active_version())
            .field("storage", &self.storage)
            .field("balance_cache_ttl", &self.balance_cache_ttl)
            .field("sync_max_pages", &self.sync_max_pages)
            .field("port", &self.port)
            .finish()
    }
}

fn parse_number<T: std::str::FromStr>(value: Option<String>, key: &str, default: T) -> Result<T> {
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EngineError::Config(format!("{} must be a number, got '{}'", key, raw))),
        None => Ok(default),
    }
}
