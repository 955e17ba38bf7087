pub mod boot_service;
pub mod info;
pub mod mount_overlay;
pub mod remove;
pub mod status;
pub mod sync;
pub mod toggle;

use std::path::PathBuf;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::{
    cli::{BootServiceOptions, GlobalSubcommand},
    host::Host,
    state::PersistState,
};
use boot_service::BootServiceCommand;
use info::InfoCommand;
use mount_overlay::MountOverlayCommand;
use remove::RemoveCommand;
use status::StatusCommand;
use sync::SyncCommand;
use toggle::ToggleCommand;

#[async_trait]
pub trait Command {
    async fn run(&self) -> Result<()>;
}

pub trait IntoCommand {
    fn into_command(self) -> Box<dyn Command>;
}

impl IntoCommand for GlobalSubcommand {
    fn into_command(self) -> Box<dyn Command> {
        match self {
            GlobalSubcommand::Status => Box::new(StatusCommand {}),
            GlobalSubcommand::Info => Box::new(InfoCommand {}),
            GlobalSubcommand::Sync => Box::new(SyncCommand {}),
            GlobalSubcommand::Enable => Box::new(ToggleCommand { enabled: true }),
            GlobalSubcommand::Disable => Box::new(ToggleCommand { enabled: false }),
            GlobalSubcommand::Remove(remove_options) => Box::new(RemoveCommand { remove_options }),
            GlobalSubcommand::BootService(BootServiceOptions { stage }) => {
                Box::new(BootServiceCommand { stage })
            }
            GlobalSubcommand::MountOverlay(mount_overlay_options) => {
                Box::new(MountOverlayCommand {
                    mount_overlay_options,
                })
            }
        }
    }
}

/// The state published for this boot together with the persistence
/// partition it names. Fails when this boot has no usable partition.
pub(crate) async fn current_partition(host: &dyn Host) -> Result<(PersistState, PathBuf)> {
    let Some(state) = PersistState::load(host).await? else {
        bail!("No persistence state for this boot, the boot services have not run");
    };
    match state.partition.clone() {
        Some(partition) if state.available => Ok((state, partition)),
        _ => bail!(
            "Persistence is not available on this boot: {}",
            state.reason.as_deref().unwrap_or("no persistence partition")
        ),
    }
}
