use std::{future::Future, time::Duration};

use anyhow::{Context as _, Result};
use tokio::{
    signal::unix::SignalKind,
    sync::mpsc,
    time::MissedTickBehavior,
};

use crate::{config::PersistConfig, host::Host, overlay, state::PersistState};

/// Flush the persistence partition every `sync.interval_secs` and whenever
/// SIGUSR1 arrives, until SIGTERM or SIGINT.
pub async fn run(host: &dyn Host, config: &PersistConfig) -> Result<()> {
    let mut sigusr1 = tokio::signal::unix::signal(SignalKind::user_defined1())
        .context("Failed to listen for SIGUSR1")?;
    let mut sigint = tokio::signal::unix::signal(SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;

    let (wake_tx, wake_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        while sigusr1.recv().await.is_some() {
            // A flush already pending covers this request too.
            let _ = wake_tx.try_send(());
        }
    });
    let shutdown = async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("Received exit signal, prepare for exiting now");
    };

    let interval = Duration::from_secs(config.sync.interval_secs.max(1));
    let flushes = run_sync_loop(host, config, interval, wake_rx, shutdown).await;
    tracing::info!(flushes, "Sync daemon stopped");
    Ok(())
}

/// The daemon loop, returning the number of flushes done. A flush that has
/// started always completes before `shutdown` is looked at again.
pub async fn run_sync_loop(
    host: &dyn Host,
    config: &PersistConfig,
    interval: Duration,
    mut wake: mpsc::Receiver<()>,
    shutdown: impl Future<Output = ()>,
) -> u64 {
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; the boot stages have just synced.
    ticker.tick().await;

    let mut flushes = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
            Some(()) = wake.recv() => tracing::debug!("Flush requested"),
        }

        match sync_once(host, config).await {
            Ok(true) => flushes += 1,
            Ok(false) => {}
            Err(e) => tracing::warn!("Failed to flush the persistence partition: {e:#}"),
        }
    }
    flushes
}

/// Flush when this boot has a mounted persistence partition. The state is
/// reloaded every time: `remove` or a late detection may have changed it.
async fn sync_once(host: &dyn Host, config: &PersistConfig) -> Result<bool> {
    let state = PersistState::load(host).await?;
    let Some(partition) = state
        .filter(|state| state.available)
        .and_then(|state| state.partition)
    else {
        tracing::debug!("Persistence unavailable, nothing to flush");
        return Ok(false);
    };

    let mount_point = &config.partition.mount_point;
    if !overlay::is_partition_mounted(host, &partition, mount_point).await? {
        tracing::debug!(?partition, "Persistence partition not mounted, nothing to flush");
        return Ok(false);
    }
    overlay::flush(host, mount_point).await?;
    Ok(true)
}
