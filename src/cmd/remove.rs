use std::path::Path;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use dialoguer::{console::Term, Confirm};

use crate::{
    blockdev,
    cli::RemoveOptions,
    error::PersistError,
    host::{Host, HostExt as _, SystemHost},
    types::PERSIST_LABEL,
};

pub struct RemoveCommand {
    pub remove_options: RemoveOptions,
}

#[async_trait]
impl super::Command for RemoveCommand {
    async fn run(&self) -> Result<()> {
        let yes = self.remove_options.yes;
        remove_partition(&SystemHost::new(), |partition, device| {
            if yes {
                return Ok(true);
            }
            if !Term::stderr().is_term() {
                bail!("Standard error is not a terminal. Please use '--yes' to confirm the operation in non-interactive mode.");
            }
            Ok(Confirm::new()
                .with_prompt(format!(
                    "The persistence partition {} on {} and all of its data will be deleted. Do you want to continue?",
                    partition.display(),
                    device.display()
                ))
                .default(false)
                .interact()?)
        })
        .await
    }
}

/// Delete this boot's persistence partition from the boot device.
///
/// `confirm` is asked with the partition and its disk once every check has
/// passed; nothing is changed when it answers `false`.
pub async fn remove_partition(
    host: &dyn Host,
    confirm: impl FnOnce(&Path, &Path) -> Result<bool> + Send,
) -> Result<()> {
    let (state, partition) = super::current_partition(host).await?;

    let device = blockdev::inspect(host, &partition)
        .await
        .with_context(|| format!("Failed to inspect {partition:?}"))?;
    if device.is_mounted() {
        return Err(PersistError::AlreadyMounted(partition.clone()))
            .context("Refusing to remove a mounted partition, reboot without persistence first");
    }
    let Some(number) = device.partn else {
        bail!("Cannot determine the partition number of {partition:?}");
    };
    let Some(parent) = device.parent_node() else {
        bail!("Cannot determine the disk holding {partition:?}");
    };
    if state.boot_device.as_deref() != Some(parent.as_path()) {
        return Err(PersistError::IntegrityMismatch {
            subject: format!("disk of {}", partition.display()),
            expected: format!("{:?}", state.boot_device),
            found: parent.display().to_string(),
        }
        .into());
    }

    if !confirm(&partition, &parent)? {
        bail!("Operation canceled");
    }

    // The table may have changed while we were waiting for the user.
    let current = blockdev::inspect(host, &partition)
        .await
        .with_context(|| format!("Failed to inspect {partition:?}"))?;
    if current.label.as_deref() != Some(PERSIST_LABEL) || current.partn != Some(number) {
        return Err(PersistError::IntegrityMismatch {
            subject: partition.display().to_string(),
            expected: format!("partition {number} labelled {PERSIST_LABEL}"),
            found: format!("partition {:?} labelled {:?}", current.partn, current.label),
        }
        .into());
    }
    if current.is_mounted() {
        return Err(PersistError::AlreadyMounted(partition.clone()).into());
    }

    let parent_str = parent.to_string_lossy();
    let number_str = number.to_string();
    tracing::info!(?partition, "Removing persistence partition");
    host.run("parted", &["-s", &parent_str, "rm", &number_str])
        .await
        .with_context(|| format!("Failed to remove partition {number} from {parent:?}"))?;
    if let Err(e) = host.run("partprobe", &[&parent_str]).await {
        tracing::warn!("Failed to re-read the partition table of {parent:?}: {e:#}");
    }
    if let Err(e) = host.run("udevadm", &["settle"]).await {
        tracing::warn!("udevadm settle failed: {e:#}");
    }

    state
        .unavailable("persistence partition removed")
        .save(host)
        .await?;
    tracing::info!(?partition, "Persistence partition removed");
    Ok(())
}
