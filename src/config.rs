use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Crypto configuration.
///
/// The master key is supplied out-of-band (environment or secret bootstrap)
/// and is never persisted by this service. An empty key is rejected at
/// cipher construction, not silently tolerated.
#[derive(Debug, Deserialize, Clone)]
pub struct CryptoConfig {
    /// Master encryption key, base64 or raw passphrase.
    /// Set via ARCANUM_CRYPTO__MASTER_KEY.
    #[serde(default)]
    pub master_key: String,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            master_key: String::new(),
        }
    }
}

/// Database configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// Read-cache settings for decrypted public/admin-tier values
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_cache_max_size() -> usize {
    256
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            max_size: default_cache_max_size(),
        }
    }
}

/// Taxonomy registry settings
#[derive(Debug, Deserialize, Clone)]
pub struct TaxonomyConfig {
    /// How often the in-memory name lookup is refreshed from the store
    #[serde(default = "default_taxonomy_refresh")]
    pub refresh_secs: u64,
}

fn default_taxonomy_refresh() -> u64 {
    300
}

impl Default for TaxonomyConfig {
    fn default() -> Self {
        Self {
            refresh_secs: default_taxonomy_refresh(),
        }
    }
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub taxonomy: TaxonomyConfig,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default config file
            .add_source(File::with_name("config/default").required(false))
            // Override with local config if present
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (prefix: ARCANUM_)
            // e.g., ARCANUM_DATABASE__URL, ARCANUM_CRYPTO__MASTER_KEY
            .add_source(
                Environment::with_prefix("ARCANUM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Initialize the global config singleton
    pub fn init() -> Result<&'static Self, ConfigError> {
        let config = Self::load()?;
        Ok(CONFIG.get_or_init(|| config))
    }

    /// Get reference to the global config
    pub fn get() -> &'static Self {
        CONFIG
            .get()
            .expect("Config not initialized. Call AppConfig::init() first.")
    }
}
