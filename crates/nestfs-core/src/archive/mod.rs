//! The virtual file system of a mounted archive.
//!
//! [`ArchiveFileSystem`] holds the mutable directory tree of one archive
//! between mounting and the next sync. The archive codec itself is an
//! external collaborator behind the [`ArchiveDriver`] trait.

mod driver;
mod fs;
mod node;

pub use driver::{ArchiveDriver, ArchiveEntry, ArchiveInput, ArchiveOutput, DriverError};
pub use fs::{ArchiveFileSystem, TreeError};
pub use node::{DEFAULT_DIRECTORY_MODE, DEFAULT_FILE_MODE, Node, NodeType, Times};
