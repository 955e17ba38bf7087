use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Filesystem label of the persistence partition.
pub const PERSIST_LABEL: &str = "persistence";

/// Filesystem the persistence partition is formatted with.
pub const PERSIST_FSTYPE: &str = "ext4";

/// The whole-disk device the running session was booted from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BootDevice {
    pub path: PathBuf,
    #[serde(default)]
    pub removable: bool,
    #[serde(default)]
    pub optical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl BootDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            removable: false,
            optical: false,
            serial: None,
            size: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A partition labelled [`PERSIST_LABEL`] on the boot device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PersistPartition {
    pub path: PathBuf,
    pub parent: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fstype: Option<String>,
}

impl PersistPartition {
    pub fn has_expected_fstype(&self) -> bool {
        self.fstype.as_deref() == Some(PERSIST_FSTYPE)
    }
}
