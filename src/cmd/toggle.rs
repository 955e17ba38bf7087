use anyhow::{Context as _, Result};
use async_trait::async_trait;

use crate::{
    fs::mount::PartitionRoot,
    host::{Host, SystemHost},
    state::options::PersistOptions,
};

/// `enable` and `disable`.
pub struct ToggleCommand {
    pub enabled: bool,
}

#[async_trait]
impl super::Command for ToggleCommand {
    async fn run(&self) -> Result<()> {
        set_enabled(&SystemHost::new(), self.enabled).await
    }
}

/// Write the option file on this boot's persistence partition. Takes effect
/// on the next boot.
pub async fn set_enabled(host: &dyn Host, enabled: bool) -> Result<()> {
    let (_, partition) = super::current_partition(host).await?;

    let root = PartitionRoot::open(host, &partition, false)
        .await
        .with_context(|| format!("Failed to access {partition:?}"))?;
    let mut options = PersistOptions::load(host, root.path()).await?;
    if options.enabled == enabled {
        tracing::info!("Persistence is already {}", if enabled { "enabled" } else { "disabled" });
        return Ok(());
    }
    options.enabled = enabled;
    options.save(host, root.path()).await?;

    tracing::info!(
        ?partition,
        "Persistence {}, takes effect on the next boot",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}
