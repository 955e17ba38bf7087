use std::path::PathBuf;

use thiserror::Error;

/// Failures the persistence machinery distinguishes between.
///
/// Only [`PersistError::IntegrityMismatch`] is fatal to the operation that
/// raised it. Everything else ends with persistence disabled for the
/// session, and [`PersistError::AlreadyMounted`] is not a failure at all.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("no boot device could be resolved")]
    DeviceNotFound,

    #[error("no persistence partition available on {device:?}: {reason}")]
    PartitionUnavailable { device: PathBuf, reason: String },

    #[error("integrity check failed on {subject}: expected {expected}, found {found}")]
    IntegrityMismatch {
        subject: String,
        expected: String,
        found: String,
    },

    #[error("partition {partition:?} has filesystem {found:?}, expected {expected}")]
    FilesystemTypeMismatch {
        partition: PathBuf,
        found: Option<String>,
        expected: &'static str,
    },

    #[error("{0:?} is already mounted")]
    AlreadyMounted(PathBuf),
}

pub type ProvisionError = PersistError;

impl PersistError {
    pub fn unavailable(device: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::PartitionUnavailable {
            device: device.into(),
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::IntegrityMismatch { .. })
    }
}
