use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use glob::{MatchOptions, Pattern};

use super::ResolveStrategy;
use crate::{blockdev, host::Host, types::PERSIST_LABEL};

/// Last resort: a device whose volume label looks like a live medium.
pub struct LabelStrategy {
    patterns: Vec<Pattern>,
}

impl LabelStrategy {
    pub fn new(patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|raw| match Pattern::new(raw) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    tracing::warn!("Ignoring invalid label pattern {raw:?}: {e}");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn matches(&self, label: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: false,
            ..Default::default()
        };
        label != PERSIST_LABEL
            && self
                .patterns
                .iter()
                .any(|pattern| pattern.matches_with(label, options))
    }
}

#[async_trait]
impl ResolveStrategy for LabelStrategy {
    fn name(&self) -> &'static str {
        "volume-label"
    }

    async fn resolve(&self, host: &dyn Host) -> Result<Option<PathBuf>> {
        let devices = blockdev::list_block_devices(host, None).await?;
        for device in blockdev::physical(&devices) {
            let Some(label) = device.label.as_deref() else {
                continue;
            };
            tracing::debug!(device = %device.name, label, "Checking volume label");
            if self.matches(label) {
                return Ok(Some(device.node()));
            }
        }
        Ok(None)
    }
}
