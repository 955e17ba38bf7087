use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use super::ResolveStrategy;
use crate::{blockdev, host::Host};

/// Files only a bootable live medium carries, relative to its root.
pub const BOOT_ARTIFACTS: &[&str] = &[
    "live/vmlinuz",
    "casper/vmlinuz",
    "boot/vmlinuz",
    "EFI/BOOT/BOOTX64.EFI",
];

/// A mounted removable device carrying a kernel or EFI loader.
pub struct ArtifactStrategy;

#[async_trait]
impl ResolveStrategy for ArtifactStrategy {
    fn name(&self) -> &'static str {
        "boot-artifacts"
    }

    async fn resolve(&self, host: &dyn Host) -> Result<Option<PathBuf>> {
        let devices = blockdev::list_block_devices(host, None).await?;

        for device in blockdev::physical(&devices) {
            if !device.rm {
                continue;
            }
            for mount_point in device.mount_points() {
                tracing::debug!(device = %device.name, ?mount_point, "Looking for boot artifacts");
                for artifact in BOOT_ARTIFACTS {
                    if host.exists(&mount_point.join(artifact)).await {
                        tracing::debug!(device = %device.name, artifact, "Boot artifact found");
                        return Ok(Some(device.node()));
                    }
                }
            }
        }
        Ok(None)
    }
}
