use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::{
    config::PersistConfig,
    host::{Host, SystemHost},
    overlay,
};

pub struct SyncCommand {}

#[async_trait]
impl super::Command for SyncCommand {
    async fn run(&self) -> Result<()> {
        let config = crate::config::load_config().await?;
        sync_now(&SystemHost::new(), &config).await?;
        tracing::info!("Overlay contents flushed to the persistence partition");
        Ok(())
    }
}

pub async fn sync_now(host: &dyn Host, config: &PersistConfig) -> Result<()> {
    let (_, partition) = super::current_partition(host).await?;
    let mount_point = &config.partition.mount_point;
    if !overlay::is_partition_mounted(host, &partition, mount_point).await? {
        bail!("Persistence partition {partition:?} is not mounted at {mount_point:?}");
    }
    overlay::flush(host, mount_point).await
}
