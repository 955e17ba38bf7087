use std::path::PathBuf;

use anyhow::{Context as _, Result};
use async_trait::async_trait;

use crate::config::PersistConfig;

use super::ConfigSource;

pub const LIVEPERSIST_CONFIG_DIR_DEFAULT: &str = "/etc/livepersist";

pub struct FileSystemConfigSource {
    config_dir: PathBuf,
}

impl FileSystemConfigSource {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn new_with_default_config_dir() -> Self {
        Self::new(PathBuf::from(LIVEPERSIST_CONFIG_DIR_DEFAULT))
    }
}

#[async_trait]
impl ConfigSource for FileSystemConfigSource {
    fn source_debug_string(&self) -> String {
        format!("filesystem: {:?}", self.config_dir)
    }

    async fn get_config(&self) -> Result<PersistConfig> {
        let config_path = self.config_dir.join("config.toml");

        if !tokio::fs::try_exists(&config_path).await.unwrap_or(false) {
            tracing::debug!("Config file not found, using defaults: {config_path:?}");
            return Ok(PersistConfig::default());
        }
        tracing::debug!("Loading config from: {config_path:?}");

        tokio::fs::read_to_string(&config_path)
            .await
            .map_err(anyhow::Error::from)
            .and_then(|content| {
                toml::from_str::<PersistConfig>(&content).context("Failed to parse content as TOML")
            })
            .with_context(|| format!("Failed to load config from: {config_path:?}"))
    }
}
