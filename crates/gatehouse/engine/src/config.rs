//! Engine configuration
//!
//! Loaded in layers: built-in defaults, then an optional file, then
//! `GATEHOUSE_*` environment variables. Nested keys use a double
//! underscore, e.g. `GATEHOUSE_TOKEN__TTL_SECS=60`.

use crate::error::{EngineError, EngineResult};
use crate::retry::RetryPolicy;
use gatehouse_risk::RiskConfig;
use gatehouse_storage::{AuditSink, CheckpointStore, InMemoryStorage};
use gatehouse_token::TokenSecret;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub token: TokenConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Confirmation token configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Token lifetime in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// How far in the future an issued-at may lie
    #[serde(default = "default_max_clock_skew_secs")]
    pub max_clock_skew_secs: u64,

    /// Hex-encoded 32-byte signing secret. A random one is generated when
    /// absent, which invalidates outstanding tokens on restart.
    #[serde(default)]
    pub secret_hex: Option<String>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_clock_skew_secs: default_max_clock_skew_secs(),
            secret_hex: None,
        }
    }
}

impl TokenConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_secs(self.max_clock_skew_secs)
    }

    pub fn secret(&self) -> EngineResult<TokenSecret> {
        match &self.secret_hex {
            Some(hex) => Ok(TokenSecret::from_hex(hex)?),
            None => {
                tracing::warn!("No token secret configured; generated an ephemeral one");
                Ok(TokenSecret::generate())
            }
        }
    }
}

/// Optimistic concurrency configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Reload-and-retry rounds in `resume`/`cancel` before `EngineBusy`
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: default_max_conflict_retries(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (for development/testing)
    #[default]
    Memory,

    /// PostgreSQL storage (feature `postgres`)
    Postgres {
        /// Connection URL
        url: String,

        /// Maximum connections in pool
        #[serde(default = "default_pool_size")]
        max_connections: u32,

        /// Connection timeout in seconds
        #[serde(default = "default_connection_timeout")]
        connect_timeout_secs: u64,
    },
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level, used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_ttl_secs() -> u64 {
    30
}

fn default_max_clock_skew_secs() -> u64 {
    5
}

fn default_max_conflict_retries() -> u32 {
    5
}

fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Load configuration from file and environment
    pub fn load(path: Option<&str>) -> EngineResult<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&EngineConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("GATEHOUSE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.risk.validate().map_err(|e| EngineError::Config(e.to_string()))?;
        Ok(config)
    }
}

/// The two storage contracts, served by one backend.
#[derive(Clone)]
pub struct StorageHandles {
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub audit: Arc<dyn AuditSink>,
}

impl StorageHandles {
    pub fn memory() -> Self {
        let storage = Arc::new(InMemoryStorage::new());
        Self {
            checkpoints: storage.clone(),
            audit: storage,
        }
    }
}

impl StorageConfig {
    /// Open the configured backend.
    pub async fn open(&self) -> EngineResult<StorageHandles> {
        match self {
            StorageConfig::Memory => {
                tracing::info!("Using in-memory storage");
                Ok(StorageHandles::memory())
            }
            #[cfg(feature = "postgres")]
            StorageConfig::Postgres {
                url,
                max_connections,
                connect_timeout_secs,
            } => {
                let storage = Arc::new(
                    gatehouse_storage::postgres::PostgresStorage::connect_with_options(
                        url,
                        *max_connections,
                        *connect_timeout_secs,
                    )
                    .await?,
                );
                tracing::info!(max_connections, "Connected to PostgreSQL storage");
                Ok(StorageHandles {
                    checkpoints: storage.clone(),
                    audit: storage,
                })
            }
            #[cfg(not(feature = "postgres"))]
            StorageConfig::Postgres { .. } => Err(EngineError::Config(
                "postgres storage requires the `postgres` feature".into(),
            )),
        }
    }
}
