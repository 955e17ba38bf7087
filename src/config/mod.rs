pub mod global;
pub mod source;

pub use source::load_config;

use std::path::PathBuf;

use global::BootServiceConfig;
use serde::{Deserialize, Serialize};

/// Everything read from `/etc/livepersist/config.toml`. Every section is
/// optional and falls back to its defaults.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct PersistConfig {
    /// Behaviour of the boot-time services.
    #[serde(default)]
    pub boot: BootServiceConfig,

    /// How the persistence partition is found and created.
    #[serde(default)]
    pub partition: PartitionConfig,

    /// Which paths are layered with writable overlays.
    #[serde(default)]
    pub overlay: OverlayConfig,

    /// Background flushing of overlay contents.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Tuning for boot device detection.
    #[serde(default)]
    pub resolver: ResolverConfig,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct PartitionConfig {
    /// Create the partition during boot when none exists. Off by default:
    /// boot only looks the partition up.
    #[serde(default)]
    pub auto_create: bool,

    /// Smallest free region, in MiB, worth turning into a partition.
    #[serde(default = "default_min_size_mib")]
    pub min_size_mib: u64,

    /// Where the partition is mounted while the session runs.
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            auto_create: false,
            min_size_mib: default_min_size_mib(),
            mount_point: default_mount_point(),
        }
    }
}

fn default_min_size_mib() -> u64 {
    512
}

fn default_mount_point() -> PathBuf {
    PathBuf::from("/run/livepersist/partition")
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct OverlayConfig {
    /// Top-level read-only paths that get a writable overlay.
    #[serde(default = "default_overlay_paths")]
    pub paths: Vec<PathBuf>,

    /// Live home directory, bind-mounted from the partition.
    #[serde(default = "default_home")]
    pub home: PathBuf,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            paths: default_overlay_paths(),
            home: default_home(),
        }
    }
}

fn default_overlay_paths() -> Vec<PathBuf> {
    ["/etc", "/usr", "/var", "/opt", "/root"]
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

fn default_home() -> PathBuf {
    PathBuf::from("/home")
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Seconds between two flushes of the partition.
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
        }
    }
}

fn default_sync_interval() -> u64 {
    30
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct ResolverConfig {
    /// Volume label patterns (shell globs, case-insensitive) tried by the
    /// last-resort label scan.
    #[serde(default = "default_label_patterns")]
    pub label_patterns: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            label_patterns: default_label_patterns(),
        }
    }
}

fn default_label_patterns() -> Vec<String> {
    ["*LIVE*", "*-live-*", "ARCH_*", "Fedora-*", "Ubuntu*", "debian*"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}
