//! A simulated machine: block devices with partitions and files, a mount
//! table, and enough of the external tools we drive to run every code path
//! without touching the real system.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use super::{ExecOutput, Host, HostLock};
use crate::blockdev::{BlockDevice, LsblkOutput};

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

const ISO9660_MAGIC_OFFSET: u64 = 32769;

#[derive(Debug, Clone, Default)]
pub struct FakePartition {
    pub number: u32,
    pub start: u64,
    /// Inclusive, like parted reports it.
    pub end: u64,
    pub fstype: Option<String>,
    pub label: Option<String>,
    pub uuid: Option<String>,
    pub partuuid: Option<String>,
    pub iso9660: bool,
    pub files: BTreeMap<PathBuf, Vec<u8>>,
    pub dirs: BTreeSet<PathBuf>,
}

impl FakePartition {
    pub fn new(number: u32, start: u64, end: u64) -> Self {
        Self {
            number,
            start,
            end,
            ..Default::default()
        }
    }

    pub fn fstype(mut self, fstype: &str) -> Self {
        self.fstype = Some(fstype.to_owned());
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_owned());
        self
    }

    pub fn uuid(mut self, uuid: &str) -> Self {
        self.uuid = Some(uuid.to_owned());
        self
    }

    pub fn partuuid(mut self, partuuid: &str) -> Self {
        self.partuuid = Some(partuuid.to_owned());
        self
    }

    pub fn iso9660(mut self) -> Self {
        self.iso9660 = true;
        self.fstype = Some("iso9660".to_owned());
        self
    }

    pub fn file(mut self, rel: &str, content: &[u8]) -> Self {
        self.files.insert(PathBuf::from(rel), content.to_vec());
        self
    }

    fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    fn tag(&self, key: &str) -> Option<&str> {
        match key {
            "LABEL" => self.label.as_deref(),
            "UUID" => self.uuid.as_deref(),
            "PARTUUID" => self.partuuid.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeDisk {
    pub name: String,
    pub size: u64,
    pub kind: &'static str,
    pub removable: bool,
    pub serial: Option<String>,
    pub table: Option<String>,
    pub fstype: Option<String>,
    pub label: Option<String>,
    pub iso9660: bool,
    pub partitions: Vec<FakePartition>,
}

impl FakeDisk {
    pub fn new(name: &str, size: u64) -> Self {
        Self {
            name: name.to_owned(),
            size,
            kind: "disk",
            removable: false,
            serial: None,
            table: None,
            fstype: None,
            label: None,
            iso9660: false,
            partitions: vec![],
        }
    }

    pub fn removable(mut self) -> Self {
        self.removable = true;
        self
    }

    pub fn optical(mut self) -> Self {
        self.kind = "rom";
        self.removable = true;
        self
    }

    pub fn loop_device(mut self) -> Self {
        self.kind = "loop";
        self
    }

    pub fn serial(mut self, serial: &str) -> Self {
        self.serial = Some(serial.to_owned());
        self
    }

    pub fn table(mut self, table: &str) -> Self {
        self.table = Some(table.to_owned());
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_owned());
        self
    }

    pub fn iso9660(mut self) -> Self {
        self.iso9660 = true;
        self.fstype = Some("iso9660".to_owned());
        self
    }

    /// Filesystem directly on the disk, without a partition table.
    pub fn fstype(mut self, fstype: &str) -> Self {
        self.fstype = Some(fstype.to_owned());
        self
    }

    pub fn partition(mut self, partition: FakePartition) -> Self {
        self.partitions.push(partition);
        self
    }

    pub fn node(&self) -> PathBuf {
        PathBuf::from(format!("/dev/{}", self.name))
    }

    fn partition_name(&self, number: u32) -> String {
        if self.name.ends_with(|c: char| c.is_ascii_digit()) {
            format!("{}p{number}", self.name)
        } else {
            format!("{}{number}", self.name)
        }
    }

    pub fn partition_node(&self, number: u32) -> PathBuf {
        PathBuf::from(format!("/dev/{}", self.partition_name(number)))
    }
}

#[derive(Debug, Clone)]
enum Backing {
    Device(PathBuf),
    Bind(PathBuf),
    Other,
}

#[derive(Debug, Clone)]
struct FakeMount {
    source: String,
    target: PathBuf,
    fstype: String,
    options: String,
    backing: Backing,
}

enum Loc {
    Root(PathBuf),
    Part {
        disk: usize,
        part: usize,
        rel: PathBuf,
    },
}

#[derive(Debug, Clone, Copy)]
enum Node {
    Disk(usize),
    Part(usize, usize),
}

struct ExecOverride {
    program: String,
    arg: Option<String>,
    output: ExecOutput,
}

#[derive(Default)]
struct FakeState {
    disks: Vec<FakeDisk>,
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
    loops: HashMap<PathBuf, PathBuf>,
    mounts: Vec<FakeMount>,
    log: Vec<Vec<String>>,
    overrides: Vec<ExecOverride>,
    locks: Vec<PathBuf>,
    next_id: u32,
}

#[derive(Default)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn add_disk(&self, disk: FakeDisk) -> &Self {
        self.with(|s| s.disks.push(disk));
        self
    }

    pub fn set_cmdline(&self, cmdline: &str) -> &Self {
        self.write_file("/proc/cmdline", cmdline.as_bytes())
    }

    pub fn write_file(&self, path: impl AsRef<Path>, content: &[u8]) -> &Self {
        self.with(|s| s.write(path.as_ref(), content.to_vec()));
        self
    }

    pub fn create_dir(&self, path: impl AsRef<Path>) -> &Self {
        self.with(|s| s.mkdir(path.as_ref()));
        self
    }

    pub fn read_file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.with(|s| s.read(path.as_ref()))
    }

    /// Attach `backing_file` to the loop device `loop_dev`.
    pub fn attach_loop(&self, loop_dev: impl AsRef<Path>, backing_file: impl AsRef<Path>) -> &Self {
        self.with(|s| {
            s.loops
                .insert(loop_dev.as_ref().to_owned(), backing_file.as_ref().to_owned())
        });
        self
    }

    /// Mount a device as if it had been mounted before we started.
    pub fn mount_device(&self, device: impl AsRef<Path>, target: impl AsRef<Path>) -> &Self {
        let device = device.as_ref().to_string_lossy().into_owned();
        let target = target.as_ref().to_string_lossy().into_owned();
        self.with(|s| s.mount(&["-o", "ro", &device, &target]))
            .unwrap_or_else(|e| panic!("fake mount failed: {e:#}"));
        self
    }

    /// Make every invocation of `program` (whose arguments contain `arg`, if
    /// given) exit with `code`.
    pub fn fail_command(&self, program: &str, arg: Option<&str>, code: i32) -> &Self {
        self.override_command(
            program,
            arg,
            ExecOutput {
                code,
                stdout: vec![],
                stderr: format!("{program}: simulated failure").into_bytes(),
            },
        )
    }

    pub fn override_command(&self, program: &str, arg: Option<&str>, output: ExecOutput) -> &Self {
        self.with(|s| {
            s.overrides.push(ExecOverride {
                program: program.to_owned(),
                arg: arg.map(str::to_owned),
                output,
            })
        });
        self
    }

    /// Keep answering `lsblk <device>` with what it shows now, like a kernel
    /// that missed a partition table re-read.
    pub fn freeze_lsblk(&self, device: &str) -> &Self {
        let stdout = self
            .with(|s| s.lsblk(&[device]))
            .unwrap_or_else(|e| panic!("fake lsblk failed: {e:#}"));
        self.override_command(
            "lsblk",
            Some(device),
            ExecOutput {
                code: 0,
                stdout,
                stderr: vec![],
            },
        )
    }

    pub fn clear_overrides(&self) {
        self.with(|s| s.overrides.clear());
    }

    /// Every command run so far, program first.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.with(|s| s.log.clone())
    }

    pub fn count_commands(&self, program: &str, arg: Option<&str>) -> usize {
        self.with(|s| {
            s.log
                .iter()
                .filter(|cmd| cmd[0] == program)
                .filter(|cmd| arg.map(|a| cmd[1..].iter().any(|c| c == a)).unwrap_or(true))
                .count()
        })
    }

    pub fn clear_commands(&self) {
        self.with(|s| s.log.clear());
    }

    /// Number of mounts currently stacked on `target`.
    pub fn mounts_at(&self, target: impl AsRef<Path>) -> usize {
        self.with(|s| {
            s.mounts
                .iter()
                .filter(|m| m.target == target.as_ref())
                .count()
        })
    }

    pub fn locks_taken(&self) -> Vec<PathBuf> {
        self.with(|s| s.locks.clone())
    }

    pub fn disk(&self, name: &str) -> Option<FakeDisk> {
        self.with(|s| s.disks.iter().find(|d| d.name == name).cloned())
    }

    /// Power cycle: mounts and everything under `/run` are gone, disks keep
    /// their content.
    pub fn reboot(&self) {
        self.with(|s| {
            s.mounts.clear();
            s.files.retain(|p, _| !p.starts_with("/run"));
            s.dirs.retain(|p| !p.starts_with("/run"));
            s.log.clear();
            s.locks.clear();
        });
    }
}

impl FakeState {
    fn node(&self, path: &Path) -> Option<Node> {
        for (d, disk) in self.disks.iter().enumerate() {
            if disk.node() == path {
                return Some(Node::Disk(d));
            }
            for (p, part) in disk.partitions.iter().enumerate() {
                if disk.partition_node(part.number) == path {
                    return Some(Node::Part(d, p));
                }
            }
        }
        None
    }

    fn locate(&self, path: &Path) -> Loc {
        let best = self
            .mounts
            .iter()
            .filter(|m| path.starts_with(&m.target))
            .max_by_key(|m| m.target.components().count());
        let Some(mount) = best else {
            return Loc::Root(path.to_owned());
        };
        let rel = path
            .strip_prefix(&mount.target)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        match &mount.backing {
            Backing::Device(node) => match self.node(node) {
                Some(Node::Part(disk, part)) => Loc::Part { disk, part, rel },
                _ => Loc::Root(path.to_owned()),
            },
            Backing::Bind(src) => self.locate(&join_rel(src, &rel)),
            Backing::Other => Loc::Root(path.to_owned()),
        }
    }

    fn read(&self, path: &Path) -> Option<Vec<u8>> {
        if path == Path::new("/proc/self/mounts") {
            return Some(self.render_mounts().into_bytes());
        }
        match self.locate(path) {
            Loc::Root(p) => self.files.get(&p).cloned(),
            Loc::Part { disk, part, rel } => {
                self.disks[disk].partitions[part].files.get(&rel).cloned()
            }
        }
    }

    fn write(&mut self, path: &Path, content: Vec<u8>) {
        match self.locate(path) {
            Loc::Root(p) => {
                if let Some(parent) = p.parent() {
                    self.dirs.extend(parent.ancestors().map(Path::to_path_buf));
                }
                self.files.insert(p, content);
            }
            Loc::Part { disk, part, rel } => {
                let part = &mut self.disks[disk].partitions[part];
                if let Some(parent) = rel.parent() {
                    part.dirs.extend(parent.ancestors().map(Path::to_path_buf));
                }
                part.files.insert(rel, content);
            }
        }
    }

    fn mkdir(&mut self, path: &Path) {
        match self.locate(path) {
            Loc::Root(p) => self.dirs.extend(p.ancestors().map(Path::to_path_buf)),
            Loc::Part { disk, part, rel } => self.disks[disk].partitions[part]
                .dirs
                .extend(rel.ancestors().map(Path::to_path_buf)),
        }
    }

    fn is_dir(&self, path: &Path) -> bool {
        if self.mounts.iter().any(|m| m.target == path) {
            return true;
        }
        match self.locate(path) {
            Loc::Root(p) => self.dirs.contains(&p) || self.files.keys().any(|f| f.starts_with(&p) && *f != p),
            Loc::Part { disk, part, rel } => {
                let part = &self.disks[disk].partitions[part];
                rel.as_os_str().is_empty()
                    || part.dirs.contains(&rel)
                    || part.files.keys().any(|f| f.starts_with(&rel) && *f != rel)
            }
        }
    }

    fn exists(&self, path: &Path) -> bool {
        self.node(path).is_some()
            || self.read(path).is_some()
            || self.is_dir(path)
    }

    fn dirs_under(&self, dir: &Path) -> Vec<PathBuf> {
        let dirs = match self.locate(dir) {
            Loc::Root(p) => self
                .dirs
                .iter()
                .filter_map(|d| Some(d.strip_prefix(&p).ok()?.to_owned()))
                .collect::<Vec<_>>(),
            Loc::Part { disk, part, rel } => self.disks[disk].partitions[part]
                .dirs
                .iter()
                .filter_map(|d| Some(d.strip_prefix(&rel).ok()?.to_owned()))
                .collect(),
        };
        dirs.into_iter()
            .filter(|d| !d.as_os_str().is_empty())
            .collect()
    }

    fn remove_tree(&mut self, path: &Path) {
        match self.locate(path) {
            Loc::Root(p) => {
                self.files.retain(|f, _| !f.starts_with(&p));
                self.dirs.retain(|d| !d.starts_with(&p));
            }
            Loc::Part { disk, part, rel } => {
                let part = &mut self.disks[disk].partitions[part];
                part.files.retain(|f, _| !f.starts_with(&rel));
                part.dirs.retain(|d| !d.starts_with(&rel));
            }
        }
    }

    fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        if !self.is_dir(from) {
            let content = self
                .read(from)
                .ok_or_else(|| anyhow!("{from:?}: No such file or directory"))?;
            self.remove_tree(from);
            self.write(to, content);
            return Ok(());
        }
        let files = self.files_under(from);
        let dirs = self.dirs_under(from);
        self.remove_tree(from);
        self.mkdir(to);
        for dir in dirs {
            self.mkdir(&to.join(dir));
        }
        for (rel, content) in files {
            self.write(&to.join(rel), content);
        }
        Ok(())
    }

    fn files_under(&self, dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
        match self.locate(dir) {
            Loc::Root(p) => self
                .files
                .iter()
                .filter_map(|(f, c)| Some((f.strip_prefix(&p).ok()?.to_owned(), c.clone())))
                .collect(),
            Loc::Part { disk, part, rel } => self.disks[disk].partitions[part]
                .files
                .iter()
                .filter_map(|(f, c)| Some((f.strip_prefix(&rel).ok()?.to_owned(), c.clone())))
                .collect(),
        }
    }

    fn render_mounts(&self) -> String {
        self.mounts
            .iter()
            .map(|m| {
                format!(
                    "{} {} {} {} 0 0\n",
                    m.source,
                    m.target.display(),
                    m.fstype,
                    m.options
                )
            })
            .collect()
    }

    fn canonicalize(&self, path: &Path) -> Option<PathBuf> {
        let name = path.file_name()?.to_str()?;
        let dir = path.parent()?.to_str()?;
        let key = match dir {
            "/dev/disk/by-uuid" => Some("UUID"),
            "/dev/disk/by-partuuid" => Some("PARTUUID"),
            "/dev/disk/by-label" => Some("LABEL"),
            _ => None,
        };
        if let Some(key) = key {
            return self.disks.iter().find_map(|disk| {
                disk.partitions
                    .iter()
                    .find(|p| p.tag(key) == Some(name))
                    .map(|p| disk.partition_node(p.number))
            });
        }
        self.exists(path).then(|| path.to_owned())
    }

    fn fresh_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:08x}-fake", self.next_id)
    }

    fn exec(&mut self, program: &str, args: &[&str]) -> Result<ExecOutput> {
        let mut line = vec![program.to_owned()];
        line.extend(args.iter().map(|a| a.to_string()));
        self.log.push(line);

        if let Some(o) = self.overrides.iter().find(|o| {
            o.program == program
                && o.arg
                    .as_deref()
                    .map(|a| args.contains(&a))
                    .unwrap_or(true)
        }) {
            return Ok(o.output.clone());
        }

        let result = match program {
            "lsblk" => self.lsblk(args),
            "blkid" => self.blkid(args),
            "losetup" => self.losetup(args),
            "parted" => self.parted(args),
            "mkfs.ext4" => self.mkfs(args),
            "mount" => self.mount(args).map(|_| vec![]),
            "umount" => self.umount(args),
            "cp" => self.cp(args),
            "partprobe" | "udevadm" | "sync" | "modprobe" => Ok(vec![]),
            _ => Err(anyhow!("{program}: command not found")),
        };
        Ok(match result {
            Ok(stdout) => ExecOutput {
                code: 0,
                stdout,
                stderr: vec![],
            },
            Err(e) => ExecOutput {
                code: 1,
                stdout: vec![],
                stderr: format!("{e:#}").into_bytes(),
            },
        })
    }

    fn block_device(&self, node: Node) -> BlockDevice {
        let mountpoints = |path: &Path| {
            let source = path.to_string_lossy();
            let points: Vec<Option<String>> = self
                .mounts
                .iter()
                .filter(|m| m.source == source)
                .map(|m| Some(m.target.to_string_lossy().into_owned()))
                .collect();
            if points.is_empty() {
                vec![None]
            } else {
                points
            }
        };
        match node {
            Node::Disk(d) => {
                let disk = &self.disks[d];
                BlockDevice {
                    name: disk.name.clone(),
                    path: Some(disk.node().to_string_lossy().into_owned()),
                    dev_type: Some(disk.kind.to_owned()),
                    rm: disk.removable,
                    ro: false,
                    size: Some(disk.size),
                    fstype: disk.fstype.clone(),
                    label: disk.label.clone(),
                    serial: disk.serial.clone(),
                    mountpoints: mountpoints(&disk.node()),
                    children: (0..disk.partitions.len())
                        .map(|p| self.block_device(Node::Part(d, p)))
                        .collect(),
                    ..Default::default()
                }
            }
            Node::Part(d, p) => {
                let disk = &self.disks[d];
                let part = &disk.partitions[p];
                let node = disk.partition_node(part.number);
                BlockDevice {
                    name: disk.partition_name(part.number),
                    path: Some(node.to_string_lossy().into_owned()),
                    dev_type: Some("part".to_owned()),
                    rm: disk.removable,
                    ro: false,
                    size: Some(part.size()),
                    fstype: part.fstype.clone(),
                    label: part.label.clone(),
                    uuid: part.uuid.clone(),
                    partuuid: part.partuuid.clone(),
                    pkname: Some(disk.name.clone()),
                    partn: Some(part.number),
                    mountpoints: mountpoints(&node),
                    ..Default::default()
                }
            }
        }
    }

    fn lsblk(&self, args: &[&str]) -> Result<Vec<u8>> {
        let target = args.last().filter(|a| a.starts_with("/dev/"));
        let blockdevices = match target {
            Some(path) => {
                let node = self
                    .node(Path::new(path))
                    .ok_or_else(|| anyhow!("lsblk: {path}: not a block device"))?;
                vec![self.block_device(node)]
            }
            None => (0..self.disks.len())
                .map(|d| self.block_device(Node::Disk(d)))
                .collect(),
        };
        Ok(serde_json::to_vec_pretty(&LsblkOutput { blockdevices })?)
    }

    fn blkid(&self, args: &[&str]) -> Result<Vec<u8>> {
        let token = args
            .iter()
            .position(|a| *a == "-t")
            .and_then(|i| args.get(i + 1))
            .ok_or_else(|| anyhow!("blkid: missing -t"))?;
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| anyhow!("blkid: bad token {token}"))?;
        let mut out = String::new();
        for disk in &self.disks {
            if key == "LABEL" && disk.label.as_deref() == Some(value) {
                out.push_str(&format!("{}\n", disk.node().display()));
            }
            for part in &disk.partitions {
                if part.tag(key) == Some(value) {
                    out.push_str(&format!("{}\n", disk.partition_node(part.number).display()));
                }
            }
        }
        if out.is_empty() {
            // blkid exits 2 when nothing matches
            bail!("no match");
        }
        Ok(out.into_bytes())
    }

    fn losetup(&self, args: &[&str]) -> Result<Vec<u8>> {
        let dev = args
            .last()
            .ok_or_else(|| anyhow!("losetup: missing device"))?;
        let backing = self
            .loops
            .get(Path::new(dev))
            .ok_or_else(|| anyhow!("losetup: {dev}: no such loop device"))?;
        Ok(format!("{}\n", backing.display()).into_bytes())
    }

    fn disk_mut(&mut self, dev: &str) -> Result<&mut FakeDisk> {
        match self.node(Path::new(dev)) {
            Some(Node::Disk(d)) => Ok(&mut self.disks[d]),
            _ => bail!("parted: could not stat device {dev}"),
        }
    }

    fn parted(&mut self, args: &[&str]) -> Result<Vec<u8>> {
        let dev = args
            .iter()
            .find(|a| a.starts_with("/dev/"))
            .ok_or_else(|| anyhow!("parted: missing device"))?
            .to_string();

        if args.contains(&"print") {
            let disk = self.disk_mut(&dev)?.clone();
            return Ok(print_free(&disk).into_bytes());
        }

        if let Some(i) = args.iter().position(|a| *a == "mkpart") {
            let field = |n: usize| {
                args.get(i + n)
                    .map(|a| a.trim_end_matches('B'))
                    .ok_or_else(|| anyhow!("parted: mkpart needs 4 arguments"))
            };
            let start: u64 = field(3)?.parse()?;
            let end: u64 = field(4)?.parse()?;
            let partuuid = self.fresh_id();
            let disk = self.disk_mut(&dev)?;
            if disk.table.is_none() {
                bail!("parted: {dev}: unrecognised disk label");
            }
            if end >= disk.size
                || start > end
                || disk
                    .partitions
                    .iter()
                    .any(|p| start <= p.end && p.start <= end)
            {
                bail!("parted: the requested range overlaps an existing partition");
            }
            let number = disk.partitions.iter().map(|p| p.number).max().unwrap_or(0) + 1;
            let mut partition = FakePartition::new(number, start, end);
            partition.partuuid = Some(partuuid);
            disk.partitions.push(partition);
            return Ok(vec![]);
        }

        if let Some(i) = args.iter().position(|a| *a == "rm") {
            let number: u32 = args
                .get(i + 1)
                .ok_or_else(|| anyhow!("parted: rm needs a partition number"))?
                .parse()?;
            let disk = self.disk_mut(&dev)?;
            let before = disk.partitions.len();
            disk.partitions.retain(|p| p.number != number);
            if disk.partitions.len() == before {
                bail!("parted: partition {number} does not exist");
            }
            return Ok(vec![]);
        }

        bail!("parted: unsupported invocation {args:?}")
    }

    fn mkfs(&mut self, args: &[&str]) -> Result<Vec<u8>> {
        let label = args
            .iter()
            .position(|a| *a == "-L")
            .and_then(|i| args.get(i + 1))
            .map(|l| l.to_string());
        let dev = args.last().ok_or_else(|| anyhow!("mkfs: missing device"))?;
        let uuid = self.fresh_id();
        let Some(Node::Part(d, p)) = self.node(Path::new(dev)) else {
            bail!("mkfs.ext4: {dev}: no such partition");
        };
        let part = &mut self.disks[d].partitions[p];
        part.fstype = Some("ext4".to_owned());
        part.label = label;
        part.uuid = Some(uuid);
        part.files.clear();
        part.dirs.clear();
        part.iso9660 = false;
        Ok(vec![])
    }

    fn mount(&mut self, args: &[&str]) -> Result<()> {
        let mut fstype = None;
        let mut options = None;
        let mut bind = false;
        let mut positional = vec![];
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match *arg {
                "-t" => fstype = iter.next().copied(),
                "-o" => options = iter.next().copied(),
                "--bind" => bind = true,
                other => positional.push(other),
            }
        }
        let [source, target] = positional[..] else {
            bail!("mount: expected a source and a target, got {positional:?}");
        };
        let target = PathBuf::from(target);

        let mount = if bind {
            let src = PathBuf::from(source);
            if !self.is_dir(&src) {
                bail!("mount: {source}: special device does not exist");
            }
            let (source, fstype) = match self.locate(&src) {
                Loc::Part { disk, part, .. } => {
                    let d = &self.disks[disk];
                    let p = &d.partitions[part];
                    (
                        d.partition_node(p.number).to_string_lossy().into_owned(),
                        p.fstype.clone().unwrap_or_default(),
                    )
                }
                Loc::Root(_) => ("none".to_owned(), "none".to_owned()),
            };
            FakeMount {
                source,
                target,
                fstype,
                options: "rw,bind".to_owned(),
                backing: Backing::Bind(src),
            }
        } else if fstype == Some("overlay") {
            FakeMount {
                source: source.to_owned(),
                target,
                fstype: "overlay".to_owned(),
                options: format!("rw,{}", options.unwrap_or_default()),
                backing: Backing::Other,
            }
        } else {
            let node = PathBuf::from(source);
            let found = match self.node(&node) {
                Some(Node::Part(d, p)) => self.disks[d].partitions[p].fstype.clone(),
                Some(Node::Disk(d)) => self.disks[d].fstype.clone(),
                None => bail!("mount: {source}: special device does not exist"),
            };
            let Some(found) = found else {
                bail!("mount: {source}: wrong fs type, bad option, bad superblock");
            };
            if fstype.is_some_and(|t| t != found) {
                bail!("mount: {source}: wrong fs type, bad option, bad superblock");
            }
            FakeMount {
                source: source.to_owned(),
                target,
                fstype: found,
                options: options.unwrap_or("rw").to_owned(),
                backing: Backing::Device(node),
            }
        };
        self.mounts.push(mount);
        Ok(())
    }

    fn umount(&mut self, args: &[&str]) -> Result<Vec<u8>> {
        let target = args.last().ok_or_else(|| anyhow!("umount: missing target"))?;
        let Some(i) = self
            .mounts
            .iter()
            .rposition(|m| m.target == Path::new(target) || m.source == *target)
        else {
            bail!("umount: {target}: not mounted");
        };
        self.mounts.remove(i);
        Ok(vec![])
    }

    fn cp(&mut self, args: &[&str]) -> Result<Vec<u8>> {
        let paths: Vec<&str> = args.iter().copied().filter(|a| !a.starts_with('-')).collect();
        let [src, dst] = paths[..] else {
            bail!("cp: expected a source and a destination");
        };
        let src = Path::new(src.trim_end_matches("/."));
        let dst = PathBuf::from(dst);
        for (rel, content) in self.files_under(src) {
            self.write(&dst.join(rel), content);
        }
        self.mkdir(&dst);
        Ok(vec![])
    }
}

fn join_rel(base: &Path, rel: &Path) -> PathBuf {
    if rel.as_os_str().is_empty() {
        base.to_owned()
    } else {
        base.join(rel)
    }
}

/// `parted -m unit B print free` for a fake disk.
fn print_free(disk: &FakeDisk) -> String {
    let mut out = format!(
        "BYT;\n{}:{}B:scsi:512:512:{}:Fake Disk:;\n",
        disk.node().display(),
        disk.size,
        disk.table.as_deref().unwrap_or("unknown")
    );
    if disk.table.is_none() {
        return out;
    }
    let mut partitions = disk.partitions.clone();
    partitions.sort_by_key(|p| p.start);
    let mut cursor = 0u64;
    for part in &partitions {
        if part.start > cursor {
            out.push_str(&format!(
                "1:{cursor}B:{}B:{}B:free;\n",
                part.start - 1,
                part.start - cursor
            ));
        }
        out.push_str(&format!(
            "{}:{}B:{}B:{}B:{}::;\n",
            part.number,
            part.start,
            part.end,
            part.size(),
            part.fstype.as_deref().unwrap_or("")
        ));
        cursor = part.end + 1;
    }
    if cursor < disk.size {
        out.push_str(&format!(
            "1:{cursor}B:{}B:{}B:free;\n",
            disk.size - 1,
            disk.size - cursor
        ));
    }
    out
}

#[async_trait]
impl Host for FakeHost {
    async fn read_to_string(&self, path: &Path) -> Result<String> {
        let content = self
            .with(|s| s.read(path))
            .ok_or_else(|| anyhow!("{path:?}: No such file or directory"))?;
        Ok(String::from_utf8(content)?)
    }

    async fn read_at(&self, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.with(|s| {
            if let Some(node) = s.node(path) {
                let iso = match node {
                    Node::Disk(d) => s.disks[d].iso9660,
                    Node::Part(d, p) => s.disks[d].partitions[p].iso9660,
                };
                let mut data = vec![0u8; len];
                if iso && offset == ISO9660_MAGIC_OFFSET {
                    let magic = b"CD001";
                    let n = magic.len().min(len);
                    data[..n].copy_from_slice(&magic[..n]);
                }
                return Ok(data);
            }
            let content = s
                .read(path)
                .ok_or_else(|| anyhow!("{path:?}: No such file or directory"))?;
            let start = (offset as usize).min(content.len());
            let end = start.saturating_add(len).min(content.len());
            Ok(content[start..end].to_vec())
        })
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.with(|s| s.write(path, contents.to_vec()));
        Ok(())
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.with(|s| s.mkdir(path));
        Ok(())
    }

    async fn remove_dir_all(&self, path: &Path) -> Result<()> {
        self.with(|s| s.remove_tree(path));
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.with(|s| s.rename(from, to))
    }

    async fn exists(&self, path: &Path) -> bool {
        self.with(|s| s.exists(path))
    }

    async fn is_dir(&self, path: &Path) -> bool {
        self.with(|s| s.is_dir(path))
    }

    async fn is_block_device(&self, path: &Path) -> bool {
        self.with(|s| s.node(path).is_some())
    }

    async fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        self.with(|s| s.canonicalize(path))
            .ok_or_else(|| anyhow!("{path:?}: No such file or directory"))
    }

    async fn exec(&self, program: &str, args: &[&str]) -> Result<ExecOutput> {
        self.with(|s| s.exec(program, args))
    }

    async fn lock_exclusive(&self, path: &Path) -> Result<HostLock> {
        self.with(|s| s.locks.push(path.to_owned()));
        Ok(HostLock::unlocked())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostExt as _;

    #[tokio::test]
    async fn test_partition_files_follow_mounts() -> Result<()> {
        let host = FakeHost::new();
        host.add_disk(
            FakeDisk::new("sdb", 8 * GIB).table("gpt").partition(
                FakePartition::new(1, MIB, GIB - 1)
                    .fstype("ext4")
                    .file("hello", b"world"),
            ),
        );
        assert!(!host.exists(Path::new("/mnt/hello")).await);

        host.run("mount", &["/dev/sdb1", "/mnt"]).await?;
        assert_eq!(host.read_to_string(Path::new("/mnt/hello")).await?, "world");
        host.write_atomic(Path::new("/mnt/a/b"), b"c").await?;
        assert!(host.is_dir(Path::new("/mnt/a")).await);

        host.run("umount", &["/mnt"]).await?;
        assert!(!host.exists(Path::new("/mnt/a/b")).await);
        let disk = host.disk("sdb").unwrap();
        assert_eq!(disk.partitions[0].files[Path::new("a/b")], b"c");
        Ok(())
    }

    #[tokio::test]
    async fn test_parted_print_free() -> Result<()> {
        let host = FakeHost::new();
        host.add_disk(
            FakeDisk::new("sdb", 4 * GIB)
                .table("msdos")
                .partition(FakePartition::new(1, MIB, GIB - 1).iso9660()),
        );
        let out = host
            .run("parted", &["-s", "-m", "/dev/sdb", "unit", "B", "print", "free"])
            .await?;
        let out = String::from_utf8(out)?;
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[1], "/dev/sdb:4294967296B:scsi:512:512:msdos:Fake Disk:;");
        assert_eq!(lines[2], "1:0B:1048575B:1048576B:free;");
        assert_eq!(lines[4], "1:1073741824B:4294967295B:3221225472B:free;");
        Ok(())
    }
}
