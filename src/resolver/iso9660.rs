use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

use super::ResolveStrategy;
use crate::{blockdev, host::Host};

/// The ISO9660 primary volume descriptor starts at sector 16; its standard
/// identifier follows the one-byte type code.
pub const ISO9660_MAGIC_OFFSET: u64 = 16 * 2048 + 1;
pub const ISO9660_MAGIC: &[u8] = b"CD001";

/// A block device carrying an ISO9660 filesystem, removable ones first.
pub struct Iso9660Strategy;

pub async fn has_iso9660_signature(host: &dyn Host, device: &Path) -> Result<bool> {
    let magic = host
        .read_at(device, ISO9660_MAGIC_OFFSET, ISO9660_MAGIC.len())
        .await?;
    Ok(magic == ISO9660_MAGIC)
}

#[async_trait]
impl ResolveStrategy for Iso9660Strategy {
    fn name(&self) -> &'static str {
        "iso9660-signature"
    }

    async fn resolve(&self, host: &dyn Host) -> Result<Option<PathBuf>> {
        let devices = blockdev::list_block_devices(host, None).await?;
        let mut candidates = blockdev::physical(&devices);
        candidates.sort_by_key(|device| !device.rm);

        for device in candidates {
            let node = device.node();
            match has_iso9660_signature(host, &node).await {
                Ok(true) => {
                    tracing::debug!(?node, "ISO9660 signature found");
                    return Ok(Some(node));
                }
                Ok(false) => tracing::debug!(?node, "No ISO9660 signature"),
                Err(e) => tracing::debug!(?node, "Cannot read device: {e:#}"),
            }
        }
        Ok(None)
    }
}
