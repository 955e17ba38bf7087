use std::path::Path;

use anyhow::Result;

use crate::{
    fs::mount::MountTable,
    host::Host,
    resolver::cmdline::CMDLINE_PATH,
    state::{BootloaderHint, PersistState},
};

const VENTOY_DM_DEVICE: &str = "/dev/mapper/ventoy";
const VENTOY_MOUNT_POINT: &str = "/VTOY";

/// Work out how the live image was started and publish it as the initial
/// state of this boot. Reads only.
pub async fn run(host: &dyn Host) -> Result<()> {
    let hint = detect_bootloader(host).await;
    tracing::info!(bootloader = %hint, "Boot loader detected");
    PersistState::initial(hint).save(host).await
}

pub async fn detect_bootloader(host: &dyn Host) -> BootloaderHint {
    let cmdline = match host.read_to_string(Path::new(CMDLINE_PATH)).await {
        Ok(cmdline) => cmdline,
        Err(e) => {
            tracing::warn!("Failed to read the kernel command line: {e:#}");
            String::new()
        }
    };
    tracing::debug!(cmdline = cmdline.trim(), "Kernel command line");

    if is_ventoy(host, &cmdline).await {
        return BootloaderHint::Ventoy;
    }
    hint_from_cmdline(&cmdline)
}

async fn is_ventoy(host: &dyn Host, cmdline: &str) -> bool {
    if host.exists(Path::new(VENTOY_DM_DEVICE)).await {
        tracing::debug!("Found {VENTOY_DM_DEVICE}");
        return true;
    }
    if cmdline
        .split_whitespace()
        .any(|token| token.to_ascii_lowercase().starts_with("ventoy"))
    {
        tracing::debug!("Found a ventoy parameter on the kernel command line");
        return true;
    }
    match MountTable::load(host).await {
        Ok(table) => table
            .entries()
            .iter()
            .any(|entry| entry.target.starts_with(VENTOY_MOUNT_POINT)),
        Err(e) => {
            tracing::warn!("{e:#}");
            false
        }
    }
}

fn hint_from_cmdline(cmdline: &str) -> BootloaderHint {
    let tokens: Vec<_> = cmdline.split_whitespace().collect();
    if tokens.contains(&"rd.live.image") || tokens.iter().any(|t| t.starts_with("root=live:")) {
        BootloaderHint::DracutLive
    } else if tokens.contains(&"boot=live") {
        BootloaderHint::DebianLive
    } else if tokens.contains(&"boot=casper") {
        BootloaderHint::Casper
    } else {
        BootloaderHint::Unknown
    }
}
