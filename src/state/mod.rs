//! Records handed from one boot stage to the next, and across boots.
//!
//! [`PersistState`] lives in boot-scoped tmpfs and is rebuilt every boot.
//! [`marker::BootMarker`] and [`options::PersistOptions`] live on the
//! persistence partition itself.

pub mod marker;
pub mod options;

use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::{
    host::Host,
    types::{BootDevice, PersistPartition},
};

pub const LIVEPERSIST_STATE_PATH: &str = "/run/livepersist/state.toml";

/// Directory on the persistence partition holding our own records.
pub const RECORD_DIR_IN_PARTITION: &str = ".livepersist";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PersistPhase {
    #[default]
    Unresolved,
    DeviceFound,
    PartitionResolved,
    Mounted,
}

impl Display for PersistPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistPhase::Unresolved => write!(f, "unresolved"),
            PersistPhase::DeviceFound => write!(f, "device-found"),
            PersistPhase::PartitionResolved => write!(f, "partition-resolved"),
            PersistPhase::Mounted => write!(f, "mounted"),
        }
    }
}

/// How the live image was started, as far as we can tell.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BootloaderHint {
    /// A multi-ISO boot tool mapping the image through device-mapper.
    Ventoy,
    DracutLive,
    DebianLive,
    Casper,
    #[default]
    Unknown,
}

impl Display for BootloaderHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootloaderHint::Ventoy => write!(f, "ventoy"),
            BootloaderHint::DracutLive => write!(f, "dracut-live"),
            BootloaderHint::DebianLive => write!(f, "debian-live"),
            BootloaderHint::Casper => write!(f, "casper"),
            BootloaderHint::Unknown => write!(f, "unknown"),
        }
    }
}

/// Snapshot of persistence availability for the current boot.
///
/// Values are never mutated in place: each transition returns a new
/// snapshot, and readers always [`PersistState::load`] a fresh copy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct PersistState {
    #[serde(default)]
    pub phase: PersistPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_device: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<PathBuf>,

    #[serde(default)]
    pub available: bool,

    #[serde(default)]
    pub bootloader: BootloaderHint,

    /// Why persistence is unavailable, when it is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PersistState {
    pub fn initial(bootloader: BootloaderHint) -> Self {
        Self {
            bootloader,
            ..Default::default()
        }
    }

    pub fn with_device(&self, device: &BootDevice) -> Result<Self> {
        if !matches!(self.phase, PersistPhase::Unresolved) {
            bail!("Cannot record a boot device in phase {}", self.phase);
        }
        Ok(Self {
            phase: PersistPhase::DeviceFound,
            boot_device: Some(device.path.clone()),
            partition: None,
            available: false,
            bootloader: self.bootloader,
            reason: None,
        })
    }

    pub fn with_partition(&self, partition: &PersistPartition) -> Result<Self> {
        if !matches!(self.phase, PersistPhase::DeviceFound) {
            bail!("Cannot record a partition in phase {}", self.phase);
        }
        if self.boot_device.as_deref() != Some(partition.parent.as_path()) {
            bail!(
                "Partition {:?} is on {:?}, not on the boot device {:?}",
                partition.path,
                partition.parent,
                self.boot_device
            );
        }
        Ok(Self {
            phase: PersistPhase::PartitionResolved,
            partition: Some(partition.path.clone()),
            available: true,
            reason: None,
            ..self.clone()
        })
    }

    pub fn with_mounted(&self) -> Result<Self> {
        if !matches!(
            self.phase,
            PersistPhase::PartitionResolved | PersistPhase::Mounted
        ) {
            bail!("Cannot record mounted overlays in phase {}", self.phase);
        }
        Ok(Self {
            phase: PersistPhase::Mounted,
            ..self.clone()
        })
    }

    /// Persistence is off for this boot. The boot device, if any, is kept
    /// for diagnostics.
    pub fn unavailable(&self, reason: impl Into<String>) -> Self {
        let phase = match self.boot_device {
            Some(_) => PersistPhase::DeviceFound,
            None => PersistPhase::Unresolved,
        };
        Self {
            phase,
            partition: None,
            available: false,
            reason: Some(reason.into()),
            ..self.clone()
        }
    }

    pub async fn save(&self, host: &dyn Host) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        host.write_atomic(Path::new(LIVEPERSIST_STATE_PATH), content.as_bytes())
            .await
            .with_context(|| format!("Failed to write state to {LIVEPERSIST_STATE_PATH}"))?;
        tracing::info!("Successfully wrote persistence state to {LIVEPERSIST_STATE_PATH}");
        Ok(())
    }

    /// Load the state published by the boot stages. `None` when no stage has
    /// run during this boot.
    pub async fn load(host: &dyn Host) -> Result<Option<Self>> {
        let path = Path::new(LIVEPERSIST_STATE_PATH);
        if !host.exists(path).await {
            return Ok(None);
        }
        host.read_to_string(path)
            .await
            .and_then(|content| toml::from_str(&content).map_err(anyhow::Error::from))
            .map(Some)
            .with_context(|| format!("Failed to read state from {LIVEPERSIST_STATE_PATH}"))
    }
}
