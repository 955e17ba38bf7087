pub mod cached;
pub mod fs;

use anyhow::Result;
use async_trait::async_trait;
use cached::CachedConfigSource;
use fs::FileSystemConfigSource;
use lazy_static::lazy_static;
use tokio::sync::{RwLock, RwLockReadGuard};

use super::PersistConfig;

#[async_trait]
pub trait ConfigSource {
    fn source_debug_string(&self) -> String;

    async fn get_config(&self) -> Result<PersistConfig>;
}

lazy_static! {
    static ref LIVEPERSIST_CONFIG_SOURCE: RwLock<Box<dyn ConfigSource + Send + Sync>> =
        RwLock::new(Box::new(CachedConfigSource::new(
            FileSystemConfigSource::new_with_default_config_dir()
        )) as Box<dyn ConfigSource + Send + Sync>);
}

pub async fn set_config_source(config_source: impl ConfigSource + Send + Sync + 'static) {
    *(LIVEPERSIST_CONFIG_SOURCE.write().await) =
        Box::new(config_source) as Box<dyn ConfigSource + Send + Sync>;
}

pub async fn get_config_source() -> RwLockReadGuard<'static, Box<dyn ConfigSource + Send + Sync>>
{
    LIVEPERSIST_CONFIG_SOURCE.read().await
}

/// Shorthand for loading the active configuration.
pub async fn load_config() -> Result<PersistConfig> {
    get_config_source().await.get_config().await
}
