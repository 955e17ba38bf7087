//! Reading `parted --machine unit B print free`.
//!
//! Every number handed to the sizing code passed [`parse_bytes`]. Anything
//! unexpected in the output is an error, never a guess.

use std::path::Path;

use anyhow::{anyhow, bail, Result};

use crate::host::{Host, HostExt as _};

/// Partition table type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionTableType {
    Mbr,
    Gpt,
}

impl PartitionTableType {
    /// Map parted's disk label name. Labels we do not create partitions on
    /// (`loop`, `sun`, `unknown`, ...) yield `None`.
    pub fn from_parted_label(label: &str) -> Option<Self> {
        match label {
            "gpt" => Some(Self::Gpt),
            "msdos" => Some(Self::Mbr),
            _ => None,
        }
    }

    /// The name argument `mkpart` expects: a partition name on GPT, the
    /// partition kind on MBR.
    pub fn mkpart_name(&self) -> &'static str {
        match self {
            PartitionTableType::Gpt => crate::types::PERSIST_LABEL,
            PartitionTableType::Mbr => "primary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRegion {
    pub start: u64,
    /// Inclusive.
    pub end: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartedDisk {
    pub size: u64,
    /// The raw disk label as parted prints it.
    pub label: String,
    pub free: Vec<FreeRegion>,
    pub partition_numbers: Vec<u32>,
}

impl PartedDisk {
    pub fn table_type(&self) -> Option<PartitionTableType> {
        PartitionTableType::from_parted_label(&self.label)
    }

    pub fn largest_free_region(&self) -> Option<FreeRegion> {
        self.free.iter().copied().max_by_key(|region| region.size)
    }
}

/// Strict byte count: ASCII digits with an optional `B` suffix.
pub fn parse_bytes(field: &str) -> Result<u64> {
    let digits = field.strip_suffix('B').unwrap_or(field);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        bail!("{field:?} is not a byte count");
    }
    digits
        .parse()
        .map_err(|e| anyhow!("{field:?} is out of range: {e}"))
}

fn parse_number(field: &str) -> Result<u32> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        bail!("{field:?} is not a partition number");
    }
    Ok(field.parse()?)
}

pub fn parse_print_free(output: &str) -> Result<PartedDisk> {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());

    match lines.next() {
        Some("BYT;") => {}
        Some(other) => bail!("parted output is not in bytes: {other:?}"),
        None => bail!("parted printed nothing"),
    }

    let device_line = lines
        .next()
        .ok_or_else(|| anyhow!("parted printed no device line"))?;
    let fields = split_record(device_line)?;
    if fields.len() < 6 {
        bail!("malformed device line {device_line:?}");
    }
    let size = parse_bytes(fields[1])?;
    let label = fields[5].to_owned();

    let mut free = vec![];
    let mut partition_numbers = vec![];
    for line in lines {
        let fields = split_record(line)?;
        if fields.len() < 5 {
            bail!("malformed partition line {line:?}");
        }
        let number = parse_number(fields[0])?;
        let start = parse_bytes(fields[1])?;
        let end = parse_bytes(fields[2])?;
        let region_size = parse_bytes(fields[3])?;
        if end < start || end >= size {
            bail!("region {start}-{end} does not fit a disk of {size} bytes");
        }
        if fields[4] == "free" {
            free.push(FreeRegion {
                start,
                end,
                size: region_size,
            });
        } else {
            partition_numbers.push(number);
        }
    }

    Ok(PartedDisk {
        size,
        label,
        free,
        partition_numbers,
    })
}

fn split_record(line: &str) -> Result<Vec<&str>> {
    let record = line
        .strip_suffix(';')
        .ok_or_else(|| anyhow!("unterminated parted record {line:?}"))?;
    Ok(record.split(':').collect())
}

pub async fn print_free(host: &dyn Host, device: &Path) -> Result<PartedDisk> {
    let device_str = device.to_string_lossy();
    let stdout = host
        .run(
            "parted",
            &["-s", "-m", &device_str, "unit", "B", "print", "free"],
        )
        .await?;
    let output = String::from_utf8(stdout)?;
    tracing::debug!(?device, output = output.trim_end(), "Free space query");
    parse_print_free(&output)
}
