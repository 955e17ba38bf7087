use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;

use super::ResolveStrategy;
use crate::host::Host;

pub const CMDLINE_PATH: &str = "/proc/cmdline";

/// Parameters that may name the boot device, most specific first.
const DEVICE_PARAMS: &[&str] = &["livepersist.device", "live-media", "bootfrom", "root"];

/// A device named on the kernel command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRef {
    Uuid(String),
    PartUuid(String),
    Label(String),
    Path(PathBuf),
}

impl DeviceRef {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim_matches('"');
        if let Some(uuid) = value.strip_prefix("UUID=") {
            Some(Self::Uuid(uuid.to_owned()))
        } else if let Some(partuuid) = value.strip_prefix("PARTUUID=") {
            Some(Self::PartUuid(partuuid.to_owned()))
        } else if let Some(label) = value
            .strip_prefix("LABEL=")
            .or_else(|| value.strip_prefix("CDLABEL="))
        {
            Some(Self::Label(label.to_owned()))
        } else if value.starts_with("/dev/") {
            Some(Self::Path(PathBuf::from(value)))
        } else {
            // e.g. `live-media=removable`
            None
        }
    }

    fn by_link(&self) -> Option<PathBuf> {
        let link = match self {
            DeviceRef::Uuid(uuid) => format!("/dev/disk/by-uuid/{uuid}"),
            DeviceRef::PartUuid(partuuid) => format!("/dev/disk/by-partuuid/{partuuid}"),
            DeviceRef::Label(label) => format!("/dev/disk/by-label/{label}"),
            DeviceRef::Path(_) => return None,
        };
        Some(PathBuf::from(link))
    }

    fn blkid_token(&self) -> Option<String> {
        match self {
            DeviceRef::Uuid(uuid) => Some(format!("UUID={uuid}")),
            DeviceRef::PartUuid(partuuid) => Some(format!("PARTUUID={partuuid}")),
            // udev escapes spaces in labels as \x20
            DeviceRef::Label(label) => Some(format!("LABEL={}", label.replace("\\x20", " "))),
            DeviceRef::Path(_) => None,
        }
    }
}

/// Find the device reference on a kernel command line. Later occurrences of
/// a parameter override earlier ones, like the kernel does.
pub fn find_device_reference(cmdline: &str) -> Option<DeviceRef> {
    let params: Vec<(&str, Option<&str>)> = cmdline
        .split_whitespace()
        .map(|token| match token.split_once('=') {
            Some((key, value)) => (key, Some(value)),
            None => (token, None),
        })
        .collect();
    let dracut_live = params.iter().any(|(key, _)| *key == "rd.live.image");

    DEVICE_PARAMS.iter().find_map(|param| {
        let value = params
            .iter()
            .rev()
            .find(|(key, _)| key == param)
            .and_then(|(_, value)| *value)?;
        let value = if *param == "root" {
            match value.strip_prefix("live:") {
                Some(live) => live,
                // dracut accepts a bare device as root= when booting live
                None if dracut_live => value,
                None => return None,
            }
        } else {
            value
        };
        DeviceRef::parse(value)
    })
}

/// The device named explicitly on the kernel command line.
pub struct CmdlineStrategy;

#[async_trait]
impl ResolveStrategy for CmdlineStrategy {
    fn name(&self) -> &'static str {
        "cmdline"
    }

    fn authoritative(&self) -> bool {
        true
    }

    async fn resolve(&self, host: &dyn Host) -> Result<Option<PathBuf>> {
        let cmdline = host
            .read_to_string(Path::new(CMDLINE_PATH))
            .await
            .context("Failed to read kernel command line")?;
        tracing::debug!(cmdline = cmdline.trim(), "Kernel command line");

        let Some(device_ref) = find_device_reference(&cmdline) else {
            return Ok(None);
        };
        tracing::debug!(?device_ref, "Device named on the command line");
        resolve_reference(host, &device_ref).await
    }
}

async fn resolve_reference(host: &dyn Host, device_ref: &DeviceRef) -> Result<Option<PathBuf>> {
    if let DeviceRef::Path(path) = device_ref {
        return Ok(host.is_block_device(path).await.then(|| path.clone()));
    }

    if let Some(link) = device_ref.by_link() {
        if let Ok(node) = host.canonicalize(&link).await {
            tracing::debug!(?link, ?node, "Resolved through udev link");
            return Ok(Some(node));
        }
    }

    let Some(token) = device_ref.blkid_token() else {
        return Ok(None);
    };
    let output = host.exec("blkid", &["-o", "device", "-t", &token]).await?;
    if !output.success() {
        tracing::debug!(%token, code = output.code, "blkid found no device");
        return Ok(None);
    }
    Ok(output
        .stdout_string()?
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(PathBuf::from))
}
