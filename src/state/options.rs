use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use super::RECORD_DIR_IN_PARTITION;
use crate::host::Host;

pub const OPTIONS_FILE_NAME: &str = "options.toml";

/// Durable switches stored on the persistence partition and consulted by
/// the boot chain on every boot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PersistOptions {
    /// Whether overlays are mounted on boot.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
        }
    }
}

impl PersistOptions {
    pub fn path_in(partition_root: &Path) -> PathBuf {
        partition_root
            .join(RECORD_DIR_IN_PARTITION)
            .join(OPTIONS_FILE_NAME)
    }

    /// A partition without an option file is enabled.
    pub async fn load(host: &dyn Host, partition_root: &Path) -> Result<Self> {
        let path = Self::path_in(partition_root);
        if !host.exists(&path).await {
            return Ok(Self::default());
        }
        let content = host.read_to_string(&path).await?;
        toml::from_str(&content).with_context(|| format!("Failed to parse option file {path:?}"))
    }

    pub async fn save(&self, host: &dyn Host, partition_root: &Path) -> Result<()> {
        let path = Self::path_in(partition_root);
        let content = toml::to_string_pretty(self)?;
        host.write_atomic(&path, content.as_bytes())
            .await
            .with_context(|| format!("Failed to write option file {path:?}"))
    }
}
