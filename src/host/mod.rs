//! Access to the machine we are running on.
//!
//! Everything that touches block devices, the mount table or external tools
//! goes through [`Host`], so the device resolver, the provisioner and the
//! overlay mounter can be exercised against a simulated machine.

#[cfg(test)]
pub mod fake;

use std::{
    fs::File,
    io::{SeekFrom, Write as _},
    os::unix::fs::FileTypeExt as _,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use nix::fcntl::{Flock, FlockArg};
use tokio::{
    io::{AsyncReadExt as _, AsyncSeekExt as _},
    process::Command,
};

use crate::fs::cmd::CaptureOutput as _;

/// Exit status and captured output of an external tool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stdout_string(&self) -> Result<String> {
        String::from_utf8(self.stdout.clone()).context("Tool output is not valid UTF-8")
    }
}

/// Guard for an exclusive advisory lock. Released on drop.
pub struct HostLock {
    #[allow(unused)]
    inner: Option<Flock<File>>,
}

impl HostLock {
    pub fn unlocked() -> Self {
        Self { inner: None }
    }
}

#[async_trait]
pub trait Host: Send + Sync {
    async fn read_to_string(&self, path: &Path) -> Result<String>;

    /// Read `len` bytes starting at `offset`. Short reads return fewer bytes.
    async fn read_at(&self, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Replace the file content atomically, creating parent directories.
    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()>;

    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    async fn remove_dir_all(&self, path: &Path) -> Result<()>;

    /// Move a file or directory within one filesystem.
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    async fn exists(&self, path: &Path) -> bool;

    async fn is_dir(&self, path: &Path) -> bool;

    async fn is_block_device(&self, path: &Path) -> bool;

    async fn canonicalize(&self, path: &Path) -> Result<PathBuf>;

    /// Run an external tool. A non-zero exit code is not an error here.
    async fn exec(&self, program: &str, args: &[&str]) -> Result<ExecOutput>;

    async fn lock_exclusive(&self, path: &Path) -> Result<HostLock>;
}

/// Helpers on top of [`Host::exec`].
#[async_trait]
pub trait HostExt {
    /// Run a tool and return its stdout, failing on a non-zero exit code.
    async fn run(&self, program: &str, args: &[&str]) -> Result<Vec<u8>>;
}

#[async_trait]
impl<T: Host + ?Sized> HostExt for T {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Vec<u8>> {
        let output = self.exec(program, args).await?;
        if !output.success() {
            bail!(
                "`{program} {}` exited with code {}: {}",
                args.join(" "),
                output.code,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }
}

/// The real machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl SystemHost {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Host for SystemHost {
    async fn read_to_string(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {path:?}"))
    }

    async fn read_at(&self, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
        async {
            let mut file = tokio::fs::File::open(path).await?;
            file.seek(SeekFrom::Start(offset)).await?;
            let mut buf = Vec::with_capacity(len);
            file.take(len as u64).read_to_end(&mut buf).await?;
            Ok::<_, anyhow::Error>(buf)
        }
        .await
        .with_context(|| format!("Failed to read {len} bytes at offset {offset} of {path:?}"))
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let path = path.to_owned();
        let contents = contents.to_owned();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let parent = path
                .parent()
                .with_context(|| format!("No parent directory for {path:?}"))?;
            std::fs::create_dir_all(parent)?;
            let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
            tmp.write_all(&contents)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path)?;
            Ok(())
        })
        .await
        .context("background task failed")?
        .context("Failed to write file atomically")
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .with_context(|| format!("Failed to create directory {path:?}"))
    }

    async fn remove_dir_all(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_dir_all(path)
            .await
            .with_context(|| format!("Failed to remove directory {path:?}"))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        tokio::fs::rename(from, to)
            .await
            .with_context(|| format!("Failed to rename {from:?} to {to:?}"))
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn is_dir(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn is_block_device(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }

    async fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        tokio::fs::canonicalize(path)
            .await
            .with_context(|| format!("Failed to canonicalize {path:?}"))
    }

    async fn exec(&self, program: &str, args: &[&str]) -> Result<ExecOutput> {
        Command::new(program).args(args).capture_output().await
    }

    async fn lock_exclusive(&self, path: &Path) -> Result<HostLock> {
        let path = path.to_owned();
        tokio::task::spawn_blocking(move || -> Result<HostLock> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = File::options()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            let lock = Flock::lock(file, FlockArg::LockExclusive)
                .map_err(|(_, errno)| errno)
                .with_context(|| format!("Failed to lock {path:?}"))?;
            Ok(HostLock { inner: Some(lock) })
        })
        .await
        .context("background task failed")?
    }
}
