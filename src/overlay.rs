//! Layering the persistence partition over the read-only live system.
//!
//! Everything here is scoped to one parent device given by the caller, and
//! safe to run again on an already set up system: targets that are mounted
//! already are left alone.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};

use crate::{
    config::PersistConfig,
    error::PersistError,
    fs::mount::MountTable,
    host::{Host, HostExt as _},
    provision::find_partition,
    state::{options::PersistOptions, PersistState},
    types::{PersistPartition, PERSIST_FSTYPE},
};

/// Directory on the partition holding one `<name>/{upper,work}` pair per
/// overlaid path.
pub const OVERLAY_DIR_IN_PARTITION: &str = "overlay";
pub const HOME_DIR_IN_PARTITION: &str = "home";
/// Where the persistent home is assembled before it is moved into place.
pub const HOME_SEED_DIR_IN_PARTITION: &str = ".home-seed";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OverlayReport {
    pub enabled: bool,
    pub mounted: Vec<PathBuf>,
    pub already_mounted: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Mount the persistence partition found under `parent` and set up the
/// overlays and the home bind mount.
pub async fn mount_overlays(
    host: &dyn Host,
    config: &PersistConfig,
    parent: &Path,
) -> Result<OverlayReport> {
    if parent.as_os_str().is_empty() {
        bail!("No parent device given");
    }
    if !host.is_block_device(parent).await {
        bail!("{parent:?} is not a block device");
    }

    let partition = find_partition(host, parent)
        .await?
        .ok_or_else(|| PersistError::unavailable(parent, "no partition labelled persistence"))?;
    if !partition.has_expected_fstype() {
        return Err(PersistError::FilesystemTypeMismatch {
            partition: partition.path.clone(),
            found: partition.fstype.clone(),
            expected: PERSIST_FSTYPE,
        }
        .into());
    }

    let mount_point = &config.partition.mount_point;
    mount_partition(host, &partition, mount_point).await?;

    let options = PersistOptions::load(host, mount_point).await?;
    if !options.enabled {
        tracing::info!(partition = ?partition.path, "Persistence is disabled, not mounting overlays");
        return Ok(OverlayReport::default());
    }

    if let Err(e) = host.run("modprobe", &["overlay"]).await {
        // Built-in overlay support needs no module.
        tracing::warn!("Failed to load the overlay module: {e:#}");
    }

    let mut report = OverlayReport {
        enabled: true,
        ..Default::default()
    };
    for path in &config.overlay.paths {
        match mount_overlay(host, mount_point, path).await {
            Ok(true) => report.mounted.push(path.clone()),
            Ok(false) => report.already_mounted.push(path.clone()),
            Err(e) => {
                tracing::error!("Skipping overlay for {path:?}: {e:#}");
                report.failed.push(path.clone());
            }
        }
    }

    let home = &config.overlay.home;
    match bind_home(host, mount_point, home).await {
        Ok(true) => report.mounted.push(home.clone()),
        Ok(false) => report.already_mounted.push(home.clone()),
        Err(e) => {
            tracing::error!("Skipping home directory {home:?}: {e:#}");
            report.failed.push(home.clone());
        }
    }

    tracing::info!(
        mounted = report.mounted.len(),
        already_mounted = report.already_mounted.len(),
        failed = report.failed.len(),
        "Overlays set up"
    );

    if let Err(e) = record_mounted(host, &partition).await {
        tracing::warn!("Failed to record mounted overlays: {e:#}");
    }
    Ok(report)
}

async fn mount_partition(
    host: &dyn Host,
    partition: &PersistPartition,
    mount_point: &Path,
) -> Result<()> {
    let table = MountTable::load(host).await?;
    if let Some(entry) = table.find_by_target(mount_point) {
        if Path::new(&entry.source) == partition.path {
            tracing::debug!("{}", PersistError::AlreadyMounted(mount_point.to_owned()));
            return Ok(());
        }
        bail!(
            "{mount_point:?} is occupied by {}, not by {:?}",
            entry.source,
            partition.path
        );
    }

    host.create_dir_all(mount_point).await?;
    let partition_str = partition.path.to_string_lossy();
    let mount_point_str = mount_point.to_string_lossy();
    host.run(
        "mount",
        &[
            "-t",
            PERSIST_FSTYPE,
            "-o",
            "noatime",
            &partition_str,
            &mount_point_str,
        ],
    )
    .await
    .with_context(|| format!("Failed to mount {:?}", partition.path))?;
    tracing::info!(partition = ?partition.path, ?mount_point, "Persistence partition mounted");
    Ok(())
}

/// Name of the upper/work directory pair for `path`: `/var/lib` becomes
/// `var_lib`.
pub fn overlay_name(path: &Path) -> Option<String> {
    let parts: Vec<_> = path
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();
    (!parts.is_empty()).then(|| parts.join("_"))
}

/// Returns `false` when `target` is mounted already.
async fn mount_overlay(host: &dyn Host, mount_point: &Path, target: &Path) -> Result<bool> {
    let table = MountTable::load(host).await?;
    if let Some(entry) = table.find_by_target(target) {
        let ours = entry.fstype == "overlay"
            && entry
                .option_value("upperdir")
                .is_some_and(|upper| Path::new(upper).starts_with(mount_point));
        if ours {
            tracing::debug!("{}", PersistError::AlreadyMounted(target.to_owned()));
        } else {
            tracing::warn!(source = %entry.source, fstype = %entry.fstype, "{target:?} is mounted by someone else, leaving it alone");
        }
        return Ok(false);
    }

    if !host.is_dir(target).await {
        bail!("lower directory {target:?} does not exist");
    }
    let Some(name) = overlay_name(target) else {
        bail!("cannot overlay {target:?}");
    };

    let base = mount_point.join(OVERLAY_DIR_IN_PARTITION).join(name);
    let upper = base.join("upper");
    let work = base.join("work");
    host.create_dir_all(&upper).await?;
    host.create_dir_all(&work).await?;

    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        target.display(),
        upper.display(),
        work.display()
    );
    let target_str = target.to_string_lossy();
    host.run(
        "mount",
        &["-t", "overlay", "overlay", "-o", &options, &target_str],
    )
    .await
    .with_context(|| format!("Failed to mount overlay on {target:?}"))?;
    tracing::info!(?target, "Overlay mounted");
    Ok(true)
}

/// Returns `false` when `home` is mounted already.
async fn bind_home(host: &dyn Host, mount_point: &Path, home: &Path) -> Result<bool> {
    let table = MountTable::load(host).await?;
    if table.is_mounted(home) {
        tracing::debug!("{}", PersistError::AlreadyMounted(home.to_owned()));
        return Ok(false);
    }

    let persisted = mount_point.join(HOME_DIR_IN_PARTITION);
    if !host.is_dir(&persisted).await {
        seed_home(host, mount_point, home, &persisted).await?;
    }
    host.create_dir_all(home).await?;

    let persisted_str = persisted.to_string_lossy();
    let home_str = home.to_string_lossy();
    host.run("mount", &["--bind", &persisted_str, &home_str])
        .await
        .with_context(|| format!("Failed to bind mount {persisted:?} on {home:?}"))?;
    tracing::info!(?home, "Home directory bind mounted");
    Ok(true)
}

/// First boot with persistence: start from the live home content. The copy
/// only becomes `persisted` once it is complete, so a failed copy is retried
/// on the next boot.
async fn seed_home(host: &dyn Host, mount_point: &Path, home: &Path, persisted: &Path) -> Result<()> {
    let seed = mount_point.join(HOME_SEED_DIR_IN_PARTITION);
    if host.exists(&seed).await {
        tracing::debug!(?seed, "Discarding an incomplete home copy");
        host.remove_dir_all(&seed).await?;
    }
    host.create_dir_all(&seed).await?;

    if host.is_dir(home).await {
        let from = format!("{}/.", home.display());
        let to = format!("{}/", seed.display());
        host.run("cp", &["-a", &from, &to])
            .await
            .context("Failed to seed the persistent home directory")?;
    }
    host.rename(&seed, persisted).await
}

async fn record_mounted(host: &dyn Host, partition: &PersistPartition) -> Result<()> {
    let Some(state) = PersistState::load(host).await? else {
        tracing::debug!("No persistence state published for this boot, not recording mounts");
        return Ok(());
    };
    if state.partition.as_deref() != Some(partition.path.as_path()) {
        tracing::warn!(state = ?state.partition, mounted = ?partition.path, "Published state names another partition");
        return Ok(());
    }
    state.with_mounted()?.save(host).await
}

/// Whether the persistence partition is mounted where we expect it.
pub async fn is_partition_mounted(
    host: &dyn Host,
    partition: &Path,
    mount_point: &Path,
) -> Result<bool> {
    let table = MountTable::load(host).await?;
    Ok(table
        .find_by_target(mount_point)
        .is_some_and(|entry| Path::new(&entry.source) == partition))
}

/// Push everything written to the overlays down to the partition.
pub async fn flush(host: &dyn Host, mount_point: &Path) -> Result<()> {
    let mount_point_str = mount_point.to_string_lossy();
    host.run("sync", &["-f", &mount_point_str])
        .await
        .with_context(|| format!("Failed to flush {mount_point:?}"))?;
    tracing::debug!(?mount_point, "Flushed persistence partition");
    Ok(())
}
