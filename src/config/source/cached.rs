use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::PersistConfig;

use super::ConfigSource;

pub struct CachedConfigSource<T: ConfigSource + Sync> {
    inner: T,
    config: RwLock<Option<PersistConfig>>,
}

impl<T: ConfigSource + Sync> CachedConfigSource<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            config: RwLock::new(None),
        }
    }
}

#[async_trait]
impl<T: ConfigSource + Sync> ConfigSource for CachedConfigSource<T> {
    fn source_debug_string(&self) -> String {
        self.inner.source_debug_string()
    }

    async fn get_config(&self) -> Result<PersistConfig> {
        let read = self.config.read().await;
        if let Some(config) = &*read {
            return Ok(config.clone());
        }
        drop(read);

        let mut write = self.config.write().await;
        if let Some(config) = &*write {
            return Ok(config.clone());
        }

        let config = self.inner.get_config().await?;
        *write = Some(config.clone());
        Ok(config)
    }
}
