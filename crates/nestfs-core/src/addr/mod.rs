//! Addressing for the federated file system.
//!
//! This module provides the immutable identifiers every kernel operation is
//! keyed by:
//!
//! - [`Scheme`]: the driver selector of a mount point (`mem`, `file`, `zip`, ...)
//! - [`MountPoint`]: an absolute identifier of one file system instance
//! - [`EntryName`]: a normalized relative path inside one file system
//! - [`NodePath`]: a mount point plus an entry name
//!
//! # Syntax
//!
//! Root mount points are hierarchical URIs ending in a separator
//! (`file:/home/amy/`, `mem:/`). Archive mount points nest the address of
//! the archive file inside its parent file system:
//!
//! ```text
//! zip:file:/a.zip!/                  mount point of a.zip
//! zip:file:/a.zip!/inner/readme.txt  node inside a.zip
//! jar:zip:file:/a.zip!/inner.jar!/   mount point of a JAR inside a.zip
//! ```

mod entry_name;
mod mount_point;
mod node_path;
pub mod paths;
mod scheme;

pub use entry_name::EntryName;
pub use mount_point::MountPoint;
pub use node_path::NodePath;
pub use scheme::Scheme;

use thiserror::Error;

/// Separator between the parent address and the entries of an archive.
pub const MOUNT_POINT_SEPARATOR: &str = "!/";

/// Errors raised while parsing or normalizing addresses.
///
/// Addressing errors are always surfaced to the caller and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("invalid scheme '{0}'")]
    InvalidScheme(String),

    #[error("path '{path}' escapes the root of its file system")]
    EscapesRoot { path: String },

    #[error("path '{path}' contains the reserved sequence '!/'")]
    ReservedSequence { path: String },
}

impl AddressError {
    pub(crate) fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        AddressError::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }
}
