// Configuration management module
// Deployment-wide settings for the store: embedding dimension, search and
// ANN tuning knobs, storage paths.


use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default embedding dimension, matching OpenAI text-embedding-3-small.
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1536;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub ann: AnnConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Fixed embedding dimension for every collection in this deployment.
    /// Not configurable per collection; changing it invalidates stored data.
    pub embedding_dimension: usize,
    /// SQLite busy timeout, bounding how long a write waits on a lock.
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    /// Collections with at most this many chunks are searched with an exact
    /// scan; larger collections go through the ANN index.
    pub exact_scan_limit: usize,
    /// ANN candidate-list size as a multiple of the requested match count.
    /// This is the approximation knob: larger values trade speed for recall.
    pub oversample: usize,
    /// Floor on the ANN candidate-list size regardless of match count.
    pub min_candidates: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            exact_scan_limit: 1024,
            oversample: 4,
            min_candidates: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnnConfig {
    /// Row count at which a collection's IVF_PQ index is first trained.
    /// Below it (and for rows added after training) LanceDB scans exactly.
    pub train_threshold: usize,
}

impl Default for AnnConfig {
    fn default() -> Self {
        Self {
            train_threshold: 256,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Base directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid embedding dimension: {0} (must be between 1 and 8192)")]
    InvalidEmbeddingDimension(usize),
    #[error("Invalid busy timeout: {0} ms (must be between 1 and 600000)")]
    InvalidBusyTimeout(u64),
    #[error("Invalid oversample factor: {0} (must be at least 1)")]
    InvalidOversample(usize),
    #[error("Invalid minimum candidate count: {0} (must be at least 1)")]
    InvalidMinCandidates(usize),
    #[error("Invalid ANN train threshold: {0} (must be at least 2)")]
    InvalidTrainThreshold(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl From<ConfigError> for crate::StoreError {
    #[inline]
    fn from(err: ConfigError) -> Self {
        crate::StoreError::Config(err.to_string())
    }
}

impl Config {
    /// Load configuration from `config.toml` under `base_dir`, falling back
    /// to defaults when the file does not exist.
    #[inline]
    pub fn load<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let config_path = base_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self {
                storage: StorageConfig::default(),
                search: SearchConfig::default(),
                ann: AnnConfig::default(),
                base_dir: base_dir.as_ref().to_path_buf(),
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = base_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        fs::create_dir_all(&self.base_dir).with_context(|| {
            format!("Failed to create base directory: {}", self.base_dir.display())
        })?;

        let config_path = self.base_dir.join("config.toml");
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.embedding_dimension == 0 || self.storage.embedding_dimension > 8192 {
            return Err(ConfigError::InvalidEmbeddingDimension(
                self.storage.embedding_dimension,
            ));
        }
        if self.storage.busy_timeout_ms == 0 || self.storage.busy_timeout_ms > 600_000 {
            return Err(ConfigError::InvalidBusyTimeout(self.storage.busy_timeout_ms));
        }
        if self.search.oversample == 0 {
            return Err(ConfigError::InvalidOversample(self.search.oversample));
        }
        if self.search.min_candidates == 0 {
            return Err(ConfigError::InvalidMinCandidates(self.search.min_candidates));
        }
        if self.ann.train_threshold < 2 {
            return Err(ConfigError::InvalidTrainThreshold(self.ann.train_threshold));
        }
        Ok(())
    }

    /// Default base directory for the store's data and configuration.
    #[inline]
    pub fn default_base_dir() -> Result<PathBuf, ConfigError> {
        let dir = dirs::config_dir().ok_or(ConfigError::DirectoryError)?;
        Ok(dir.join("chunkstore"))
    }

    /// Path of the SQLite registry database.
    #[inline]
    pub fn registry_path(&self) -> PathBuf {
        self.base_dir.join("registry.db")
    }

    /// Path of the LanceDB directory holding the per-collection ANN tables.
    #[inline]
    pub fn vectors_path(&self) -> PathBuf {
        self.base_dir.join("vectors")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            search: SearchConfig::default(),
            ann: AnnConfig::default(),
            base_dir: PathBuf::new(),
        }
    }
}
