use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context as _, Result};
use serde::{Deserialize, Deserializer, Serialize};

use crate::host::{Host, HostExt as _};

pub const LSBLK_COLUMNS: &str =
    "NAME,PATH,TYPE,RM,RO,SIZE,FSTYPE,LABEL,PARTLABEL,UUID,PARTUUID,PKNAME,PARTN,SERIAL,MOUNTPOINTS";

#[derive(Debug, Serialize, Deserialize)]
pub struct LsblkOutput {
    pub blockdevices: Vec<BlockDevice>,
}

/// One node of `lsblk --json` output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockDevice {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(rename = "type", default)]
    pub dev_type: Option<String>,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub rm: bool,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub ro: bool,
    #[serde(default, deserialize_with = "flexible_u64")]
    pub size: Option<u64>,
    #[serde(default)]
    pub fstype: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub partlabel: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub partuuid: Option<String>,
    #[serde(default)]
    pub pkname: Option<String>,
    #[serde(default, deserialize_with = "flexible_u32")]
    pub partn: Option<u32>,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub mountpoints: Vec<Option<String>>,
    #[serde(default)]
    pub children: Vec<BlockDevice>,
}

impl BlockDevice {
    // Older lsblk has no PATH column.
    pub fn node(&self) -> PathBuf {
        self.path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("/dev/{}", self.name)))
    }

    pub fn is_loop(&self) -> bool {
        self.dev_type.as_deref() == Some("loop")
    }

    /// Optical drives never hold a writable partition.
    pub fn is_optical(&self) -> bool {
        self.dev_type.as_deref() == Some("rom")
            || (self.rm && self.name.starts_with("sr"))
    }

    pub fn mount_points(&self) -> impl Iterator<Item = &Path> {
        self.mountpoints.iter().flatten().map(Path::new)
    }

    pub fn is_mounted(&self) -> bool {
        self.mount_points().next().is_some()
    }

    pub fn parent_node(&self) -> Option<PathBuf> {
        self.pkname
            .as_ref()
            .filter(|name| !name.is_empty())
            .map(|name| PathBuf::from(format!("/dev/{name}")))
    }
}

/// Depth-first walk over devices and all of their children.
pub fn flatten(devices: &[BlockDevice]) -> Vec<&BlockDevice> {
    let mut out = vec![];
    for device in devices {
        out.push(device);
        out.extend(flatten(&device.children));
    }
    out
}

/// Devices that are candidates for holding the live image: not optical
/// and not loop-backed images themselves.
pub fn physical(devices: &[BlockDevice]) -> Vec<&BlockDevice> {
    let mut out = vec![];
    for device in devices {
        if device.is_optical() || device.is_loop() {
            tracing::debug!(device = %device.name, "Skipping optical or loop device");
            continue;
        }
        out.push(device);
        for child in flatten(&device.children) {
            if !child.is_optical() {
                out.push(child);
            }
        }
    }
    out
}

pub fn parse_lsblk(json: &[u8]) -> Result<Vec<BlockDevice>> {
    let output: LsblkOutput =
        serde_json::from_slice(json).context("Failed to parse lsblk JSON output")?;
    Ok(output.blockdevices)
}

/// List block devices, optionally limited to one device and its children.
pub async fn list_block_devices(
    host: &dyn Host,
    device: Option<&Path>,
) -> Result<Vec<BlockDevice>> {
    let device_str = device.map(|d| d.to_string_lossy().into_owned());
    let mut args = vec!["--json", "--bytes", "--output", LSBLK_COLUMNS];
    if let Some(device_str) = &device_str {
        args.push(device_str);
    }
    let stdout = host
        .run("lsblk", &args)
        .await
        .with_context(|| format!("Failed to list block devices ({device:?})"))?;
    parse_lsblk(&stdout)
}

/// Look up a single device node.
pub async fn inspect(host: &dyn Host, device: &Path) -> Result<BlockDevice> {
    list_block_devices(host, Some(device))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no device output from lsblk for {device:?}"))
}

/// Strip the partition suffix from a partition node, returning the whole
/// disk. Handles trailing-digit names (`sdb1`, `vda2`, `xvda1`) and the
/// infix `p` convention used when the disk name itself ends in a digit
/// (`nvme0n1p2`, `mmcblk0p1`, `loop0p1`). Whole-disk names are returned
/// unchanged.
pub fn parent_device(device: &Path) -> PathBuf {
    let Some(name) = device.file_name().and_then(|n| n.to_str()) else {
        return device.to_path_buf();
    };
    let disk = strip_partition_suffix(name);
    device.with_file_name(disk)
}

const TRAILING_DIGIT_PREFIXES: &[&str] = &["sd", "hd", "vd", "xvd"];

fn strip_partition_suffix(name: &str) -> &str {
    let stem = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if stem.len() == name.len() || stem.is_empty() {
        return name;
    }

    if let Some(disk) = stem.strip_suffix('p') {
        if disk.ends_with(|c: char| c.is_ascii_digit()) {
            return disk;
        }
    }

    if TRAILING_DIGIT_PREFIXES
        .iter()
        .any(|prefix| stem.starts_with(prefix))
    {
        stem
    } else {
        name
    }
}

fn flexible_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::Number(n) => n.as_u64() == Some(1),
        serde_json::Value::String(s) => s == "1" || s == "true",
        _ => false,
    })
}

fn flexible_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
            s.parse().ok()
        }
        _ => None,
    })
}

fn flexible_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    Ok(flexible_u64(deserializer)?.and_then(|n| u32::try_from(n).ok()))
}
