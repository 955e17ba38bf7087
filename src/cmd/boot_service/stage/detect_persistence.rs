use std::path::PathBuf;

use anyhow::{Context as _, Result};

use crate::{
    blockdev,
    config::PersistConfig,
    error::PersistError,
    fs::mount::{PartitionRoot, TmpMountPoint},
    host::Host,
    overlay,
    provision::{find_or_create_partition, find_partition},
    resolver::BootResolver,
    state::{marker::BootMarker, options::PersistOptions, PersistState},
    types::{PersistPartition, PERSIST_FSTYPE, PERSIST_LABEL},
};

/// Resolve the boot device, find (or create) its persistence partition,
/// publish the result and mount the overlays when persistence is enabled.
pub async fn run(host: &dyn Host, config: &PersistConfig) -> Result<()> {
    // Every detection starts over from the boot loader hint of this boot.
    let bootloader = match PersistState::load(host).await {
        Ok(state) => state.map(|state| state.bootloader).unwrap_or_default(),
        Err(e) => {
            tracing::warn!("Ignoring unreadable persistence state: {e:#}");
            Default::default()
        }
    };
    let state = PersistState::initial(bootloader);
    state.save(host).await?;

    let resolver = BootResolver::with_default_strategies(&config.resolver);
    tracing::debug!(strategies = ?resolver.strategy_names(), "Resolving boot device");
    let marker = find_boot_marker(host).await;
    let Some(device) = resolver.resolve_with_marker(host, marker.as_ref()).await else {
        return Err(PersistError::DeviceNotFound.into());
    };
    let state = state.with_device(&device)?;
    state.save(host).await?;

    let partition = if config.partition.auto_create {
        find_or_create_partition(host, &config.partition, &resolver, &device).await?
    } else {
        find_partition(host, device.path())
            .await?
            .ok_or_else(|| {
                PersistError::unavailable(
                    device.path(),
                    "no partition labelled persistence and automatic creation is off",
                )
            })?
    };
    if !partition.has_expected_fstype() {
        return Err(PersistError::FilesystemTypeMismatch {
            partition: partition.path.clone(),
            found: partition.fstype.clone(),
            expected: PERSIST_FSTYPE,
        }
        .into());
    }

    let state = state.with_partition(&partition)?;
    state.save(host).await?;

    let options = read_options(host, &partition)
        .await
        .with_context(|| format!("Failed to read the option file on {:?}", partition.path))?;
    if !options.enabled {
        tracing::info!(partition = ?partition.path, "Persistence is disabled on this partition");
        return Ok(());
    }

    let report = overlay::mount_overlays(host, config, device.path()).await?;
    if !report.failed.is_empty() {
        tracing::warn!(failed = ?report.failed, "Some paths are not persistent in this session");
    }
    Ok(())
}

async fn read_options(host: &dyn Host, partition: &PersistPartition) -> Result<PersistOptions> {
    let root = PartitionRoot::open(host, &partition.path, true).await?;
    PersistOptions::load(host, root.path()).await
}

/// The boot marker of a persistence partition that sits on the very device
/// its marker names.
async fn find_boot_marker(host: &dyn Host) -> Option<BootMarker> {
    let token = format!("LABEL={PERSIST_LABEL}");
    let candidates = match host.exec("blkid", &["-o", "device", "-t", &token]).await {
        Ok(output) if output.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect::<Vec<_>>(),
        Ok(_) => {
            tracing::debug!("No partition labelled {PERSIST_LABEL}");
            return None;
        }
        Err(e) => {
            tracing::warn!("Failed to look for persistence partitions: {e:#}");
            return None;
        }
    };

    for candidate in candidates {
        match read_marker(host, &candidate).await {
            Ok(Some(marker)) if marker.device == blockdev::parent_device(&candidate) => {
                tracing::debug!(?candidate, device = ?marker.device, "Found boot marker");
                return Some(marker);
            }
            Ok(Some(marker)) => {
                tracing::warn!(?candidate, device = ?marker.device, "Boot marker names another device, ignoring it")
            }
            Ok(None) => tracing::debug!(?candidate, "No boot marker"),
            Err(e) => tracing::debug!(?candidate, "Cannot read boot marker: {e:#}"),
        }
    }
    None
}

async fn read_marker(host: &dyn Host, partition: &std::path::Path) -> Result<Option<BootMarker>> {
    let mount = TmpMountPoint::mount(host, partition, true).await?;
    BootMarker::read(host, mount.mount_point()).await
}
