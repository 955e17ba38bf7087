use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, *};

use crate::{
    build,
    config::PersistConfig,
    fs::mount::MountTable,
    host::{Host, SystemHost},
};

/// External tools the boot services and the CLI call.
pub const REQUIRED_TOOLS: &[&str] = &[
    "lsblk", "blkid", "losetup", "parted", "partprobe", "udevadm", "mkfs.ext4", "mount",
    "umount", "cp", "sync", "modprobe",
];

pub struct InfoCommand {}

#[async_trait]
impl super::Command for InfoCommand {
    async fn run(&self) -> Result<()> {
        let config = crate::config::load_config().await?;
        let source = crate::config::source::get_config_source()
            .await
            .source_debug_string();
        let mounts = collect_mounts(&SystemHost::new(), &config).await?;

        println!(
            "livepersist v{} (commit {}, built {})",
            build::PKG_VERSION,
            build::COMMIT_HASH,
            build::BUILD_TIME
        );
        println!("Config source: {source}\n");
        println!("{}", toml::to_string_pretty(&config)?);
        print_mounts_as_table(&mounts);
        print_tools_as_table();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMount {
    /// Overlay whose upper directory lives on the persistence partition.
    Persistent,
    /// Mounted, but not by us.
    Foreign { source: String, fstype: String },
    NotMounted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub path: PathBuf,
    pub mount: PathMount,
}

/// The mount state of the partition mount point, every overlaid path and the
/// home directory.
pub async fn collect_mounts(host: &dyn Host, config: &PersistConfig) -> Result<Vec<MountInfo>> {
    let table = MountTable::load(host).await?;
    let mount_point = &config.partition.mount_point;

    let classify = |path: &Path| {
        let Some(entry) = table.find_by_target(path) else {
            return PathMount::NotMounted;
        };
        let ours = if path == mount_point {
            entry.fstype == crate::types::PERSIST_FSTYPE
        } else if path == config.overlay.home {
            // A bind mount shows the device it was taken from.
            table
                .find_by_target(mount_point)
                .is_some_and(|partition| partition.source == entry.source)
        } else {
            entry
                .option_value("upperdir")
                .is_some_and(|upper| Path::new(upper).starts_with(mount_point))
        };
        if ours {
            PathMount::Persistent
        } else {
            PathMount::Foreign {
                source: entry.source.clone(),
                fstype: entry.fstype.clone(),
            }
        }
    };

    let mut paths = vec![mount_point.clone()];
    paths.extend(config.overlay.paths.iter().cloned());
    paths.push(config.overlay.home.clone());

    Ok(paths
        .into_iter()
        .map(|path| MountInfo {
            mount: classify(&path),
            path,
        })
        .collect())
}

fn print_mounts_as_table(mounts: &[MountInfo]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Path", "Mount"]);

    for info in mounts {
        table.add_row(vec![
            Cell::new(info.path.display()),
            match &info.mount {
                PathMount::Persistent => Cell::new("persistent").fg(Color::Green),
                PathMount::Foreign { source, fstype } => {
                    Cell::new(format!("{source} ({fstype})")).fg(Color::Yellow)
                }
                PathMount::NotMounted => Cell::new("<not mounted>").fg(Color::DarkGrey),
            },
        ]);
    }

    println!("{table}");
}

fn print_tools_as_table() {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Tool", "Location"]);

    for tool in REQUIRED_TOOLS {
        table.add_row(vec![
            Cell::new(tool),
            match which::which(tool) {
                Ok(path) => Cell::new(path.display()),
                Err(_) => Cell::new("missing").fg(Color::Red),
            },
        ]);
    }

    println!("{table}");
}
