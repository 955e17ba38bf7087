use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, *};

use crate::{
    fs::mount::PartitionRoot,
    host::{Host, SystemHost},
    state::{options::PersistOptions, BootloaderHint, PersistPhase, PersistState},
};

pub struct StatusCommand {}

#[async_trait]
impl super::Command for StatusCommand {
    async fn run(&self) -> Result<()> {
        let status = collect_status(&SystemHost::new()).await?;
        print_status_as_table(&status);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistStatus {
    /// Persistence will be used: a partition is available and enabled.
    pub active: bool,
    pub available: bool,
    pub boot_device: Option<PathBuf>,
    pub partition: Option<PathBuf>,
    /// `None` when the option file could not be read.
    pub enabled: Option<bool>,
    pub phase: PersistPhase,
    pub bootloader: BootloaderHint,
    pub reason: Option<String>,
}

pub async fn collect_status(host: &dyn Host) -> Result<PersistStatus> {
    let state = match PersistState::load(host).await? {
        Some(state) => state,
        None => PersistState::default().unavailable("boot services have not run"),
    };

    let enabled = match (&state.partition, state.available) {
        (Some(partition), true) => match read_options(host, partition).await {
            Ok(options) => Some(options.enabled),
            Err(e) => {
                tracing::warn!("Failed to read the option file on {partition:?}: {e:#}");
                None
            }
        },
        _ => None,
    };

    Ok(PersistStatus {
        active: state.available && state.partition.is_some() && enabled == Some(true),
        available: state.available,
        boot_device: state.boot_device,
        partition: state.partition,
        enabled,
        phase: state.phase,
        bootloader: state.bootloader,
        reason: state.reason,
    })
}

async fn read_options(host: &dyn Host, partition: &std::path::Path) -> Result<PersistOptions> {
    let root = PartitionRoot::open(host, partition, true).await?;
    PersistOptions::load(host, root.path()).await
}

fn yes_no(value: bool) -> Cell {
    if value {
        Cell::new("yes").fg(Color::Green)
    } else {
        Cell::new("no").fg(Color::Yellow)
    }
}

fn path_or_none(path: &Option<PathBuf>) -> Cell {
    match path {
        Some(path) => Cell::new(path.display()),
        None => Cell::new("<none>").fg(Color::DarkGrey),
    }
}

pub fn print_status_as_table(status: &PersistStatus) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Property", "Value"]);

    table.add_row(vec![Cell::new("Active"), yes_no(status.active)]);
    table.add_row(vec![Cell::new("Available"), yes_no(status.available)]);
    table.add_row(vec![Cell::new("Boot Device"), path_or_none(&status.boot_device)]);
    table.add_row(vec![Cell::new("Partition"), path_or_none(&status.partition)]);
    table.add_row(vec![
        Cell::new("Enabled"),
        match status.enabled {
            Some(enabled) => yes_no(enabled),
            None => Cell::new("unknown").fg(Color::DarkGrey),
        },
    ]);
    table.add_row(vec![Cell::new("Phase"), Cell::new(status.phase)]);
    table.add_row(vec![Cell::new("Boot Loader"), Cell::new(status.bootloader)]);
    if let Some(reason) = &status.reason {
        table.add_row(vec![Cell::new("Reason"), Cell::new(reason).fg(Color::Yellow)]);
    }

    println!("{table}");
}
