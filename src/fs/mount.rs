use std::{
    io::Cursor,
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result};
use tempfile::TempDir;

use crate::{
    async_defer,
    host::{Host, HostExt as _},
};

pub const MOUNT_TABLE_PATH: &str = "/proc/self/mounts";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
    pub options: Vec<String>,
}

impl MountEntry {
    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }

    /// Value of a `key=value` mount option, e.g. `upperdir` of an overlay.
    pub fn option_value(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .filter_map(|o| o.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

impl From<mnt::MountEntry> for MountEntry {
    fn from(entry: mnt::MountEntry) -> Self {
        let options = entry
            .mntops
            .into_iter()
            .filter_map(|op| match op {
                mnt::MntOps::Write(true) => Some("rw".to_owned()),
                mnt::MntOps::Write(false) => Some("ro".to_owned()),
                mnt::MntOps::Extra(extra) => Some(extra),
                _ => None,
            })
            .collect();
        Self {
            source: entry.spec,
            target: entry.file,
            fstype: entry.vfstype,
            options,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    pub async fn load(host: &dyn Host) -> Result<Self> {
        let content = host
            .read_to_string(Path::new(MOUNT_TABLE_PATH))
            .await
            .context("Failed to read the mount table")?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let entries = mnt::MountIter::new(Cursor::new(content.as_bytes()))
            .filter_map(|item| match item {
                Ok(entry) => Some(MountEntry::from(entry)),
                Err(e) => {
                    tracing::debug!("Skipping unparseable mount table line: {e:?}");
                    None
                }
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// The entry visible at `target`: the last one mounted there wins.
    pub fn find_by_target(&self, target: &Path) -> Option<&MountEntry> {
        self.entries.iter().rev().find(|e| e.target == target)
    }

    pub fn find_by_source(&self, source: &Path) -> Option<&MountEntry> {
        let source = source.to_string_lossy();
        self.entries.iter().find(|e| e.source == source)
    }

    pub fn is_mounted(&self, target: &Path) -> bool {
        self.find_by_target(target).is_some()
    }

    /// The entry whose mount point holds `path`.
    pub fn find_containing(&self, path: &Path) -> Option<&MountEntry> {
        self.entries
            .iter()
            .filter(|e| path.starts_with(&e.target))
            .max_by_key(|e| e.target.components().count())
    }
}

/// A device mounted on a private temporary directory for the lifetime of
/// this value.
pub struct TmpMountPoint<'a> {
    host: &'a dyn Host,
    mount_dir: TempDir,
    dev: PathBuf,
}

impl<'a> TmpMountPoint<'a> {
    pub async fn mount(host: &'a dyn Host, dev: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let dev = dev.as_ref();

        let mount_dir = tempfile::Builder::new()
            .prefix("livepersist-mount-")
            .tempdir()?;
        let mount_point = mount_dir.path().to_string_lossy().into_owned();
        let dev_str = dev.to_string_lossy();

        let mut args = vec![];
        if read_only {
            args.extend(["-o", "ro"]);
        }
        args.extend([dev_str.as_ref(), mount_point.as_str()]);
        host.run("mount", &args)
            .await
            .with_context(|| format!("Failed to mount {dev:?}"))?;

        Ok(Self {
            host,
            mount_dir,
            dev: dev.to_path_buf(),
        })
    }

    pub fn mount_point(&self) -> &Path {
        self.mount_dir.path()
    }
}

impl Drop for TmpMountPoint<'_> {
    fn drop(&mut self) {
        async_defer! {
            async {
                let mount_point = self.mount_dir.path().to_string_lossy().into_owned();
                self.host
                    .run("umount", &[&mount_point])
                    .await
                    .with_context(|| format!("Failed to umount device {:?} from {:?}", self.dev, mount_point))?;
                Ok::<_, anyhow::Error>(())
            }
        }
    }
}

/// The root of a partition's filesystem, either where it is already mounted
/// or on a temporary mount made for the caller.
pub enum PartitionRoot<'a> {
    Mounted(PathBuf),
    Temporary(TmpMountPoint<'a>),
}

impl<'a> PartitionRoot<'a> {
    pub async fn open(host: &'a dyn Host, partition: &Path, read_only: bool) -> Result<Self> {
        let table = MountTable::load(host).await?;
        if let Some(entry) = table.find_by_source(partition) {
            if !read_only && entry.has_option("ro") {
                tracing::debug!(?partition, "Partition is mounted read-only, using a private mount");
            } else {
                return Ok(Self::Mounted(entry.target.clone()));
            }
        }
        Ok(Self::Temporary(
            TmpMountPoint::mount(host, partition, read_only).await?,
        ))
    }

    pub fn path(&self) -> &Path {
        match self {
            PartitionRoot::Mounted(path) => path,
            PartitionRoot::Temporary(tmp) => tmp.mount_point(),
        }
    }
}
