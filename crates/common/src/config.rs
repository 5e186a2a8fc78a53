use std::{fs, path::Path, path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::crypto::MAX_FILENAME_LENGTH;
use crate::tree::{AlwaysAppend, ForkOnDivergence, OrphanResolver, SkipIdentical};

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DATA_DIR_NAME: &str = "data";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// What a load does with an orphan that is a version of a known node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Drop exact duplicates of the current version, append the rest
    #[default]
    SkipIdentical,
    /// Append every orphan as a version
    AlwaysAppend,
    /// Drop exact duplicates, split divergent orphans into sibling nodes
    ForkOnDivergence,
}

impl OrphanPolicy {
    pub fn resolver(&self) -> Arc<dyn OrphanResolver> {
        match self {
            OrphanPolicy::SkipIdentical => Arc::new(SkipIdentical),
            OrphanPolicy::AlwaysAppend => Arc::new(AlwaysAppend),
            OrphanPolicy::ForkOnDivergence => Arc::new(ForkOnDivergence),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Directory holding the dataset blobs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Longest path segment accepted by the path layer
    #[serde(default = "default_max_name_length")]
    pub max_name_length: usize,
    #[serde(default)]
    pub orphan_policy: OrphanPolicy,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DATA_DIR_NAME)
}

fn default_max_name_length() -> usize {
    MAX_FILENAME_LENGTH
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_name_length: default_max_name_length(),
            orphan_policy: OrphanPolicy::default(),
        }
    }
}

impl VaultConfig {
    /// Config rooted at a vault directory, with the dataset in its `data` subdirectory
    pub fn for_vault(vault_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: vault_dir.as_ref().join(DATA_DIR_NAME),
            ..Default::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let raw = toml::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }
}
