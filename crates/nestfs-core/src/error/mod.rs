//! Kernel errors.
//!
//! Each layer defines its own error enum next to the code raising it. This
//! module re-exports them and defines [`FsError`], the error of the controller
//! capability surface.

use std::io;

use thiserror::Error;

use crate::addr::{MountPoint, NodePath, Scheme};
use crate::controller::AccessTypes;

pub use crate::addr::AddressError;
pub use crate::archive::{DriverError, TreeError};
pub use crate::config::ConfigError;
pub use crate::lock::LockError;
pub use crate::sync::{Severity, SyncError, SyncIssue, SyncIssueKind};

/// Errors returned by controller operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Lock(#[from] LockError),

    /// The archive driver of `mount_point` failed to decode or encode.
    #[error("Archive driver failed for {mount_point}: {source}")]
    Driver {
        mount_point: MountPoint,
        #[source]
        source: Box<DriverError>,
    },

    #[error("No such entry: {path}")]
    NoSuchEntry { path: NodePath },

    #[error("Is a directory: {path}")]
    IsDirectory { path: NodePath },

    #[error("Not a directory: {path}")]
    NotADirectory { path: NodePath },

    #[error("Access denied to {path} for {types:?}")]
    AccessDenied { path: NodePath, types: AccessTypes },

    /// The resource was closed, possibly forcibly by a sync.
    #[error("Resource closed: {path}")]
    ResourceClosed { path: NodePath },

    #[error("No driver registered for scheme '{scheme}'")]
    UnknownScheme { scheme: Scheme },

    #[error("Unsupported mount point {mount_point}: {reason}")]
    UnsupportedMountPoint {
        mount_point: MountPoint,
        reason: String,
    },

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    pub(crate) fn io(path: impl ToString, source: io::Error) -> Self {
        FsError::Io {
            path: path.to_string(),
            source,
        }
    }

    pub(crate) fn driver(mount_point: &MountPoint, source: DriverError) -> Self {
        FsError::Driver {
            mount_point: mount_point.clone(),
            source: Box::new(source),
        }
    }

    /// The closest [`io::ErrorKind`] for this error.
    pub fn io_kind(&self) -> io::ErrorKind {
        match self {
            FsError::Address(_) => io::ErrorKind::InvalidInput,
            FsError::Tree(TreeError::NoSuchNode { .. } | TreeError::NoSuchParent { .. })
            | FsError::NoSuchEntry { .. } => io::ErrorKind::NotFound,
            FsError::Tree(TreeError::NodeExists { .. }) => io::ErrorKind::AlreadyExists,
            FsError::Tree(TreeError::DirectoryNotEmpty { .. }) => io::ErrorKind::DirectoryNotEmpty,
            FsError::Tree(TreeError::RootNode { .. }) | FsError::AccessDenied { .. } => {
                io::ErrorKind::PermissionDenied
            }
            FsError::Lock(LockError::Timeout { .. }) => io::ErrorKind::TimedOut,
            FsError::Lock(LockError::UpgradeRefused { .. }) => io::ErrorKind::WouldBlock,
            FsError::IsDirectory { .. } => io::ErrorKind::IsADirectory,
            FsError::NotADirectory { .. } => io::ErrorKind::NotADirectory,
            FsError::ResourceClosed { .. } => io::ErrorKind::BrokenPipe,
            FsError::UnknownScheme { .. } | FsError::UnsupportedMountPoint { .. } => {
                io::ErrorKind::Unsupported
            }
            FsError::Driver { source, .. } => match source.as_ref() {
                DriverError::Io(e) => e.kind(),
                _ => io::ErrorKind::InvalidData,
            },
            FsError::Io { source, .. } => source.kind(),
        }
    }
}

impl From<FsError> for io::Error {
    fn from(err: FsError) -> Self {
        match err {
            FsError::Io { source, .. } => source,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::EntryName;

    #[test]
    fn test_io_kind_mapping() {
        let path = NodePath::new("mem:/a").unwrap();
        assert_eq!(
            FsError::NoSuchEntry { path: path.clone() }.io_kind(),
            io::ErrorKind::NotFound
        );
        assert_eq!(
            FsError::Tree(TreeError::NodeExists {
                name: EntryName::new("a").unwrap()
            })
            .io_kind(),
            io::ErrorKind::AlreadyExists
        );
        let err: io::Error = FsError::IsDirectory { path }.into();
        assert_eq!(err.kind(), io::ErrorKind::IsADirectory);
    }
}
