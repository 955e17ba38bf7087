use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use super::RECORD_DIR_IN_PARTITION;
use crate::{host::Host, types::BootDevice};

pub const BOOT_MARKER_FILE_NAME: &str = "boot-marker.toml";

/// Identity of the device a persistence partition was created on. Written
/// once at creation time and used to scope device lookups on later boots.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BootMarker {
    pub device: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl BootMarker {
    pub fn for_device(device: &BootDevice) -> Self {
        Self {
            device: device.path.clone(),
            serial: device.serial.clone(),
            size: device.size,
        }
    }

    pub fn path_in(partition_root: &Path) -> PathBuf {
        partition_root
            .join(RECORD_DIR_IN_PARTITION)
            .join(BOOT_MARKER_FILE_NAME)
    }

    pub async fn write(&self, host: &dyn Host, partition_root: &Path) -> Result<()> {
        let path = Self::path_in(partition_root);
        let content = toml::to_string_pretty(self)?;
        host.write_atomic(&path, content.as_bytes())
            .await
            .with_context(|| format!("Failed to write boot marker to {path:?}"))?;
        tracing::info!(device = ?self.device, "Boot marker written");
        Ok(())
    }

    /// `None` when the partition carries no marker, e.g. it was created by
    /// hand.
    pub async fn read(host: &dyn Host, partition_root: &Path) -> Result<Option<Self>> {
        let path = Self::path_in(partition_root);
        if !host.exists(&path).await {
            return Ok(None);
        }
        let content = host.read_to_string(&path).await?;
        let marker = toml::from_str(&content)
            .with_context(|| format!("Failed to parse boot marker {path:?}"))?;
        Ok(Some(marker))
    }
}
