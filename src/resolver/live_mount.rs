use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;

use super::ResolveStrategy;
use crate::{
    fs::mount::MountTable,
    host::{Host, HostExt as _},
};

/// Where the common live-boot initramfs implementations mount the boot
/// medium.
pub const LIVE_MOUNT_POINTS: &[&str] = &[
    "/run/live/medium",
    "/run/initramfs/live",
    "/lib/live/mount/medium",
    "/cdrom",
];

/// The device backing the live medium mount point.
pub struct LiveMountStrategy;

#[async_trait]
impl ResolveStrategy for LiveMountStrategy {
    fn name(&self) -> &'static str {
        "live-mount"
    }

    fn authoritative(&self) -> bool {
        true
    }

    async fn resolve(&self, host: &dyn Host) -> Result<Option<PathBuf>> {
        let table = MountTable::load(host).await?;

        for mount_point in LIVE_MOUNT_POINTS {
            let Some(entry) = table.find_by_target(Path::new(mount_point)) else {
                continue;
            };
            tracing::debug!(mount_point, source = %entry.source, fstype = %entry.fstype, "Live medium mount found");

            if !entry.source.starts_with("/dev/") {
                continue;
            }
            let source = PathBuf::from(&entry.source);
            if !is_loop_device(&source) {
                return Ok(Some(source));
            }

            // The medium is an image file (e.g. an ISO copied onto a stick):
            // the device we want is the one holding that file.
            let backing_file = loop_backing_file(host, &source).await?;
            let Some(holder) = table.find_containing(&backing_file) else {
                tracing::debug!(?backing_file, "No mount holds the loop backing file");
                continue;
            };
            tracing::debug!(?backing_file, holder = %holder.source, "Loop backing file located");
            if holder.source.starts_with("/dev/") {
                return Ok(Some(PathBuf::from(&holder.source)));
            }
        }
        Ok(None)
    }
}

fn is_loop_device(device: &Path) -> bool {
    device
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with("loop"))
        .unwrap_or(false)
}

async fn loop_backing_file(host: &dyn Host, loop_dev: &Path) -> Result<PathBuf> {
    let loop_dev_str = loop_dev.to_string_lossy();
    let stdout = host
        .run(
            "losetup",
            &["--noheadings", "--output", "BACK-FILE", "--list", &loop_dev_str],
        )
        .await
        .with_context(|| format!("Failed to query backing file of {loop_dev:?}"))?;
    let backing_file = String::from_utf8(stdout)?.trim().to_owned();
    Ok(PathBuf::from(backing_file))
}
