//! Finding the persistence partition on the boot device, or carving a new
//! one out of its free space.
//!
//! Creation is the only place this crate rewrites a partition table. It runs
//! under an advisory lock, re-resolves the boot device right before touching
//! the disk, and removes whatever it created if a later step fails.

pub mod parted;

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context as _, Result};

use crate::{
    blockdev,
    config::PartitionConfig,
    error::{PersistError, ProvisionError},
    fs::mount::TmpMountPoint,
    host::Host,
    resolver::BootResolver,
    state::marker::BootMarker,
    types::{BootDevice, PersistPartition, PERSIST_FSTYPE, PERSIST_LABEL},
};

pub const PROVISION_LOCK_PATH: &str = "/run/livepersist/provision.lock";

const ALIGNMENT: u64 = 1024 * 1024;

/// Look up the persistence partition on `device` by label. Never modifies
/// anything.
pub async fn find_partition(host: &dyn Host, device: &Path) -> Result<Option<PersistPartition>> {
    let disk = blockdev::inspect(host, device)
        .await
        .with_context(|| format!("Failed to inspect {device:?}"))?;

    let mut found: Vec<_> = blockdev::flatten(&disk.children)
        .into_iter()
        .filter(|child| child.label.as_deref() == Some(PERSIST_LABEL))
        .collect();
    found.sort_by_key(|child| child.partn);
    if found.len() > 1 {
        tracing::warn!(
            ?device,
            count = found.len(),
            "Several partitions carry the persistence label, using the first one"
        );
    }

    Ok(found.first().map(|child| PersistPartition {
        path: child.node(),
        parent: device.to_owned(),
        number: child.partn,
        fstype: child.fstype.clone(),
    }))
}

/// Return the persistence partition on `device`, creating it in the largest
/// free region when there is none.
pub async fn find_or_create_partition(
    host: &dyn Host,
    config: &PartitionConfig,
    resolver: &BootResolver,
    device: &BootDevice,
) -> Result<PersistPartition, ProvisionError> {
    let path = device.path();
    let unavailable = |e: anyhow::Error| PersistError::unavailable(path, format!("{e:#}"));

    if let Some(partition) = find_partition(host, path).await.map_err(unavailable)? {
        tracing::info!(partition = ?partition.path, "Found existing persistence partition");
        return Ok(partition);
    }

    let NewPartition { table, start, end } = plan_new_partition(host, config, path)
        .await
        .map_err(unavailable)?;

    let _lock = host
        .lock_exclusive(Path::new(PROVISION_LOCK_PATH))
        .await
        .map_err(unavailable)?;

    // The device may have been swapped while we were looking at it.
    let current = resolver.resolve(host).await;
    if current.as_ref().map(|d| d.path()) != Some(path) {
        tracing::error!(expected = ?path, found = ?current, "Boot device changed, refusing to partition");
        return Err(PersistError::IntegrityMismatch {
            subject: "boot device".to_owned(),
            expected: path.display().to_string(),
            found: current
                .map(|d| d.path.display().to_string())
                .unwrap_or_else(|| "nothing".to_owned()),
        });
    }

    // Someone else may have won the race for the lock.
    if let Some(partition) = find_partition(host, path).await.map_err(unavailable)? {
        tracing::info!(partition = ?partition.path, "Persistence partition appeared meanwhile");
        return Ok(partition);
    }

    let before = partition_numbers(host, path).await.map_err(unavailable)?;

    // Rolls back when this future is dropped half way, e.g. by the stage
    // timeout. Disarmed once creation has either succeeded or been rolled
    // back below. Runs before `_lock` is released.
    let cancel_guard = scopeguard::guard(before.clone(), |before| {
        tracing::warn!(device = ?path, "Partition creation was interrupted, rolling back");
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(rollback_logged(host, path, &before))
        })
    });

    let result = create_partition(host, device, table, start, end, &before).await;
    scopeguard::ScopeGuard::into_inner(cancel_guard);
    match result {
        Ok(partition) => {
            tracing::info!(partition = ?partition.path, size = end - start + 1, "Persistence partition created");
            Ok(partition)
        }
        Err(e) => {
            tracing::error!("Failed to create persistence partition on {path:?}: {e:#}");
            rollback_logged(host, path, &before).await;
            Err(unavailable(e))
        }
    }
}

struct NewPartition {
    table: parted::PartitionTableType,
    start: u64,
    /// Inclusive.
    end: u64,
}

/// Pick the largest free region and align it. Every input is validated
/// parted output.
async fn plan_new_partition(
    host: &dyn Host,
    config: &PartitionConfig,
    device: &Path,
) -> Result<NewPartition> {
    let disk = parted::print_free(host, device)
        .await
        .context("Failed to query free space")?;

    let Some(table) = disk.table_type() else {
        bail!(
            "partition table type {:?} is not one of gpt, msdos",
            disk.label
        );
    };

    let region = disk
        .largest_free_region()
        .ok_or_else(|| anyhow!("no free space left"))?;
    let start = align_up(region.start).ok_or_else(|| anyhow!("free region start overflows"))?;
    let end = region
        .end
        .checked_add(1)
        .map(|limit| limit / ALIGNMENT * ALIGNMENT)
        .and_then(|limit| limit.checked_sub(1))
        .ok_or_else(|| anyhow!("free region end out of range"))?;
    let min_size = config
        .min_size_mib
        .checked_mul(ALIGNMENT)
        .ok_or_else(|| anyhow!("minimum size out of range"))?;

    let size = end
        .checked_sub(start)
        .and_then(|span| span.checked_add(1))
        .unwrap_or(0);
    if size < min_size {
        bail!(
            "largest free region holds {size} bytes, {} MiB required",
            config.min_size_mib
        );
    }
    tracing::debug!(?device, ?table, start, end, size, "Planned persistence partition");
    Ok(NewPartition { table, start, end })
}

fn align_up(offset: u64) -> Option<u64> {
    offset
        .checked_add(ALIGNMENT - 1)
        .map(|o| o / ALIGNMENT * ALIGNMENT)
}

/// Partition numbers in the on-disk table. The kernel view may lag behind
/// it when re-reading the table failed.
async fn partition_numbers(host: &dyn Host, device: &Path) -> Result<BTreeSet<u32>> {
    let disk = parted::print_free(host, device).await?;
    Ok(disk.partition_numbers.into_iter().collect())
}

/// Run one step of partition creation, logging its exit code if it fails.
async fn run_step(host: &dyn Host, program: &str, args: &[&str]) -> Result<()> {
    let output = host.exec(program, args).await?;
    if !output.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::error!(program, code = output.code, stderr = stderr.trim(), "Provisioning step failed");
        bail!(
            "`{program} {}` exited with code {}",
            args.join(" "),
            output.code
        );
    }
    Ok(())
}

async fn create_partition(
    host: &dyn Host,
    device: &BootDevice,
    table: parted::PartitionTableType,
    start: u64,
    end: u64,
    before: &BTreeSet<u32>,
) -> Result<PersistPartition> {
    let path = device.path();
    let path_str = path.to_string_lossy();
    let start_str = start.to_string();
    let end_str = end.to_string();

    run_step(
        host,
        "parted",
        &[
            "-s",
            &path_str,
            "unit",
            "B",
            "mkpart",
            table.mkpart_name(),
            PERSIST_FSTYPE,
            &start_str,
            &end_str,
        ],
    )
    .await?;
    run_step(host, "partprobe", &[&path_str]).await?;
    run_step(host, "udevadm", &["settle"]).await?;

    let number = new_partition_number(host, path, before).await?;
    let node = partition_node(host, path, number).await?;
    let node_str = node.to_string_lossy();

    run_step(host, "mkfs.ext4", &["-F", "-L", PERSIST_LABEL, &node_str]).await?;

    {
        let mount = TmpMountPoint::mount(host, &node, false).await?;
        BootMarker::for_device(device)
            .write(host, mount.mount_point())
            .await?;
    }

    Ok(PersistPartition {
        path: node,
        parent: path.to_owned(),
        number: Some(number),
        fstype: Some(PERSIST_FSTYPE.to_owned()),
    })
}

async fn new_partition_number(host: &dyn Host, device: &Path, before: &BTreeSet<u32>) -> Result<u32> {
    let after = partition_numbers(host, device).await?;
    let created: Vec<u32> = after.difference(before).copied().collect();
    match created[..] {
        [number] => Ok(number),
        [] => bail!("the new partition did not show up on {device:?}"),
        _ => bail!("several new partitions showed up on {device:?}: {created:?}"),
    }
}

async fn partition_node(host: &dyn Host, device: &Path, number: u32) -> Result<PathBuf> {
    let disk = blockdev::inspect(host, device).await?;
    blockdev::flatten(&disk.children)
        .into_iter()
        .find(|child| child.partn == Some(number))
        .map(|child| child.node())
        .ok_or_else(|| anyhow!("no device node for partition {number} of {device:?}"))
}

async fn rollback_logged(host: &dyn Host, device: &Path, before: &BTreeSet<u32>) {
    if let Err(e) = rollback(host, device, before).await {
        tracing::error!("Rollback failed, the partition table of {device:?} needs manual inspection: {e:#}");
    }
}

/// Remove every partition on `device` that was not in `before`.
async fn rollback(host: &dyn Host, device: &Path, before: &BTreeSet<u32>) -> Result<()> {
    let after = partition_numbers(host, device).await?;
    let device_str = device.to_string_lossy();
    for number in after.difference(before) {
        tracing::warn!(?device, number, "Rolling back partition");
        run_step(host, "parted", &["-s", &device_str, "rm", &number.to_string()]).await?;
    }
    run_step(host, "partprobe", &[&device_str]).await
}
