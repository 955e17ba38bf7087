use std::{fmt::Display, path::PathBuf};

use clap::{Parser, Subcommand, ValueEnum};

use crate::build::CLAP_LONG_VERSION;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[clap(long_version = CLAP_LONG_VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: GlobalSubcommand,

    /// Path to the root directory where to load configuration files. Default value is /etc/livepersist.
    #[clap(long, short = 'c', global = true)]
    pub config_dir: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum GlobalSubcommand {
    /// Show whether persistence is active for this session.
    #[command(name = "status")]
    Status,

    /// Show configuration, overlaid paths and current mounts.
    #[command(name = "info")]
    Info,

    /// Flush overlay contents to the persistence partition now.
    #[command(name = "sync")]
    Sync,

    /// Turn persistence on, starting with the next boot.
    #[command(name = "enable")]
    Enable,

    /// Turn persistence off, starting with the next boot.
    #[command(name = "disable")]
    Disable,

    /// Delete the persistence partition from the boot device.
    #[command(name = "remove")]
    Remove(RemoveOptions),

    /// Running during system booting.
    #[command(name = "boot-service")]
    BootService(BootServiceOptions),

    /// Mount the persistence partition of a device and its overlays.
    #[command(name = "mount-overlay")]
    MountOverlay(MountOverlayOptions),
}

#[derive(Parser, Debug)]
pub struct RemoveOptions {
    /// Skip confirmation prompts.
    #[clap(long, short = 'y', default_value = "false")]
    pub yes: bool,
}

#[derive(Parser, Debug)]
pub struct MountOverlayOptions {
    /// Whole-disk device holding the persistence partition.
    #[clap(long)]
    pub device: PathBuf,
}

#[derive(Parser, Debug)]
pub struct BootServiceOptions {
    /// Indicate the stage of the boot process we are in.
    #[clap(long)]
    #[arg(value_enum)]
    pub stage: BootStage,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootStage {
    #[clap(name = "detect-bootloader")]
    DetectBootloader,

    #[clap(name = "detect-persistence")]
    DetectPersistence,

    #[clap(name = "sync-daemon")]
    SyncDaemon,
}

impl Display for BootStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootStage::DetectBootloader => write!(f, "detect-bootloader"),
            BootStage::DetectPersistence => write!(f, "detect-persistence"),
            BootStage::SyncDaemon => write!(f, "sync-daemon"),
        }
    }
}
