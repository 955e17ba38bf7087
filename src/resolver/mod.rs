//! Finding the block device the running live session was booted from.
//!
//! Detection is a chain of [`ResolveStrategy`] values tried in priority
//! order. The first one naming a usable device wins and nothing after it
//! runs. Whatever a strategy returns (a partition, a device-mapper node, a
//! whole disk) is reduced to the whole disk before it is reported.

pub mod artifacts;
pub mod cmdline;
pub mod iso9660;
pub mod label;
pub mod live_mount;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;

use crate::{
    blockdev::{self, BlockDevice},
    config::ResolverConfig,
    host::Host,
    state::marker::BootMarker,
    types::BootDevice,
};

#[async_trait]
pub trait ResolveStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the answer comes from the running boot itself: a device named
    /// on the command line, or the mount holding the live medium. These are
    /// honored before any cached boot marker, which may sit on another stick.
    fn authoritative(&self) -> bool {
        false
    }

    /// The device node this strategy points at, if any. Any node on the
    /// boot disk is fine.
    async fn resolve(&self, host: &dyn Host) -> Result<Option<PathBuf>>;
}

pub struct BootResolver {
    strategies: Vec<Box<dyn ResolveStrategy>>,
}

impl BootResolver {
    pub fn with_default_strategies(config: &ResolverConfig) -> Self {
        Self::with_strategies(vec![
            Box::new(cmdline::CmdlineStrategy),
            Box::new(live_mount::LiveMountStrategy),
            Box::new(artifacts::ArtifactStrategy),
            Box::new(iso9660::Iso9660Strategy),
            Box::new(label::LabelStrategy::new(&config.label_patterns)),
        ])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn ResolveStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Run the whole chain. `None` means persistence is unavailable for this
    /// session, never an error.
    pub async fn resolve(&self, host: &dyn Host) -> Option<BootDevice> {
        self.resolve_with_marker(host, None).await
    }

    /// Like [`BootResolver::resolve`], but a valid boot marker short-cuts
    /// every strategy that scans devices. A stale marker is ignored.
    pub async fn resolve_with_marker(
        &self,
        host: &dyn Host,
        marker: Option<&BootMarker>,
    ) -> Option<BootDevice> {
        let mut marker = marker;
        for strategy in &self.strategies {
            if !strategy.authoritative() {
                if let Some(marker) = marker.take() {
                    match validate_marker(host, marker).await {
                        Ok(device) => {
                            tracing::info!(device = ?device.path, "Boot device taken from boot marker");
                            return Some(device);
                        }
                        Err(e) => {
                            tracing::warn!(marker = ?marker.device, "Ignoring stale boot marker, scanning devices: {e:#}")
                        }
                    }
                }
            }

            let name = strategy.name();
            tracing::debug!(strategy = name, "Trying boot device strategy");
            let candidate = match strategy.resolve(host).await {
                Ok(Some(candidate)) => candidate,
                Ok(None) => {
                    tracing::debug!(strategy = name, "Strategy found nothing");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(strategy = name, "Strategy failed: {e:#}");
                    continue;
                }
            };

            match describe_boot_device(host, &candidate).await {
                Ok(device) if device.optical => {
                    tracing::info!(strategy = name, ?candidate, "Rejecting optical drive");
                }
                Ok(device) => {
                    tracing::info!(
                        strategy = name,
                        ?candidate,
                        device = ?device.path,
                        removable = device.removable,
                        "Boot device resolved"
                    );
                    return Some(device);
                }
                Err(e) => {
                    tracing::warn!(strategy = name, ?candidate, "Cannot use candidate device: {e:#}");
                }
            }
        }

        tracing::info!("No boot device could be resolved");
        None
    }
}

pub async fn resolve_boot_device(host: &dyn Host, config: &ResolverConfig) -> Option<BootDevice> {
    BootResolver::with_default_strategies(config)
        .resolve(host)
        .await
}

/// Check that the device named by a boot marker is still the device the
/// marker was written for.
pub async fn validate_marker(host: &dyn Host, marker: &BootMarker) -> Result<BootDevice> {
    if !host.is_block_device(&marker.device).await {
        bail!("{:?} is not a block device anymore", marker.device);
    }
    let device = describe_boot_device(host, &marker.device).await?;
    if device.path != marker.device {
        bail!(
            "{:?} is no longer a whole disk (now part of {:?})",
            marker.device,
            device.path
        );
    }
    if device.optical {
        bail!("{:?} is an optical drive", marker.device);
    }
    if marker.serial.is_some() && device.serial != marker.serial {
        bail!(
            "serial number changed from {:?} to {:?}",
            marker.serial,
            device.serial
        );
    }
    if marker.size.is_some() && device.size != marker.size {
        bail!("size changed from {:?} to {:?}", marker.size, device.size);
    }
    Ok(device)
}

const MAX_STACK_DEPTH: usize = 8;

/// Walk from any node up to the whole disk holding it, and describe that
/// disk.
pub async fn describe_boot_device(host: &dyn Host, node: &Path) -> Result<BootDevice> {
    let node = host.canonicalize(node).await.unwrap_or_else(|_| node.to_owned());

    let mut current = match blockdev::inspect(host, &node).await {
        Ok(device) => device,
        Err(e) => {
            // No lsblk data for the node itself, derive the disk from its name.
            let disk = blockdev::parent_device(&node);
            tracing::debug!(?node, ?disk, "Falling back to name-based parent lookup: {e:#}");
            blockdev::inspect(host, &disk).await?
        }
    };

    for _ in 0..MAX_STACK_DEPTH {
        let parent = match current.dev_type.as_deref() {
            Some("part") | Some("dm") => current
                .parent_node()
                .or_else(|| Some(blockdev::parent_device(&current.node()))),
            _ => None,
        };
        match parent {
            Some(parent) if parent != current.node() => {
                current = blockdev::inspect(host, &parent)
                    .await
                    .with_context(|| format!("Failed to inspect parent device {parent:?}"))?;
            }
            _ => return Ok(to_boot_device(&current)),
        }
    }
    bail!("Device stack below {node:?} is too deep")
}

fn to_boot_device(device: &BlockDevice) -> BootDevice {
    BootDevice {
        path: device.node(),
        removable: device.rm,
        optical: device.is_optical(),
        serial: device.serial.clone().filter(|s| !s.is_empty()),
        size: device.size,
    }
}
