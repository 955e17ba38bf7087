pub mod stage;

use std::{path::Path, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::{
    cli::BootStage,
    cmd::Command,
    config::PersistConfig,
    error::PersistError,
    host::{Host, SystemHost},
    resolver::cmdline::CMDLINE_PATH,
    state::PersistState,
};

/// Kernel command line tokens set by live-boot initramfs implementations.
const LIVE_CMDLINE_TOKENS: &[&str] = &["boot=live", "rd.live.image", "boot=casper"];

/// Forces the boot services to run on a system that does not look live.
const FORCE_CMDLINE_TOKEN: &str = "livepersist.force";

const LIVE_MEDIUM_DIRS: &[&str] = &["/run/live/medium", "/run/initramfs/live"];

pub struct BootServiceCommand {
    pub stage: BootStage,
}

#[async_trait]
impl Command for BootServiceCommand {
    async fn run(&self) -> Result<()> {
        let config = crate::config::load_config().await?;
        run_stage(&SystemHost::new(), &config, self.stage).await;

        tracing::info!("Boot stage {} finished", self.stage);
        Ok(())
    }
}

/// Run one boot stage. Failures are logged and recorded in the published
/// state, never returned: boot must go on without persistence.
pub async fn run_stage(host: &dyn Host, config: &PersistConfig, stage: BootStage) {
    if !is_live_session(host).await {
        tracing::info!("Not running from a live medium, skipping the {stage} stage");
        return;
    }

    let result = match stage {
        BootStage::DetectBootloader => {
            one_shot(config, stage, stage::detect_bootloader::run(host)).await
        }
        BootStage::DetectPersistence => {
            one_shot(config, stage, stage::detect_persistence::run(host, config)).await
        }
        BootStage::SyncDaemon => stage::sync_daemon::run(host, config).await,
    };

    if let Err(e) = result {
        match e.downcast_ref::<PersistError>() {
            Some(persist_error) if persist_error.is_fatal() => {
                tracing::error!("The {stage} stage was aborted: {e:#}")
            }
            _ => tracing::warn!("The {stage} stage failed, persistence is off for this session: {e:#}"),
        }
        if stage != BootStage::SyncDaemon {
            record_unavailable(host, &format!("{e:#}")).await;
        }
    }
}

async fn one_shot(
    config: &PersistConfig,
    stage: BootStage,
    task: impl std::future::Future<Output = Result<()>>,
) -> Result<()> {
    let limit = Duration::from_secs(config.boot.stage_timeout_secs);
    tokio::time::timeout(limit, task)
        .await
        .map_err(|_| anyhow!("the {stage} stage did not finish within {limit:?}"))?
}

async fn record_unavailable(host: &dyn Host, reason: &str) {
    let state = match PersistState::load(host).await {
        Ok(state) => state.unwrap_or_default(),
        Err(e) => {
            tracing::warn!("Discarding unreadable persistence state: {e:#}");
            PersistState::default()
        }
    };
    if let Err(e) = state.unavailable(reason).save(host).await {
        tracing::error!("Failed to record that persistence is unavailable: {e:#}");
    }
}

/// Whether this boot came from a live medium.
pub async fn is_live_session(host: &dyn Host) -> bool {
    match host.read_to_string(Path::new(CMDLINE_PATH)).await {
        Ok(cmdline) => {
            let live = cmdline.split_whitespace().any(|token| {
                LIVE_CMDLINE_TOKENS.contains(&token)
                    || token == FORCE_CMDLINE_TOKEN
                    || token.starts_with("root=live:")
            });
            if live {
                return true;
            }
        }
        Err(e) => tracing::warn!("Failed to read the kernel command line: {e:#}"),
    }

    for dir in LIVE_MEDIUM_DIRS {
        if host.exists(Path::new(dir)).await {
            return true;
        }
    }
    false
}
