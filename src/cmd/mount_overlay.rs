use anyhow::{Context as _, Result};
use async_trait::async_trait;

use crate::{cli::MountOverlayOptions, host::SystemHost, overlay};

pub struct MountOverlayCommand {
    pub mount_overlay_options: MountOverlayOptions,
}

#[async_trait]
impl super::Command for MountOverlayCommand {
    async fn run(&self) -> Result<()> {
        let config = crate::config::load_config().await?;
        let device = &self.mount_overlay_options.device;

        let report = overlay::mount_overlays(&SystemHost::new(), &config, device)
            .await
            .with_context(|| format!("Failed to set up persistence from {device:?}"))?;

        if !report.failed.is_empty() {
            tracing::warn!(failed = ?report.failed, "Some paths are not persistent in this session");
        }
        Ok(())
    }
}
