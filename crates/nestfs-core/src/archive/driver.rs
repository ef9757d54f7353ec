//! The contract between the kernel and format-specific archive codecs.
//!
//! A driver decodes the bytes of an archive file into entries and encodes
//! entries back into bytes. The kernel never interprets archive bytes itself.

use std::fmt::Debug;

use thiserror::Error;

use super::node::{NodeType, Times};
use crate::addr::EntryName;

/// Errors reported by archive drivers.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The bytes are not an archive of this driver's format.
    ///
    /// This is the only driver failure that makes the kernel fall back to
    /// treating the archive file as a plain file.
    #[error("not an archive: {reason}")]
    NotAnArchive { reason: String },

    #[error("no such entry in archive: '{name}'")]
    NoSuchEntry { name: EntryName },

    #[error("archive codec failure: {reason}")]
    Codec { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata of one entry stored in an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: EntryName,
    pub node_type: NodeType,
    pub size: u64,
    pub times: Times,
    pub mode: u32,
}

impl ArchiveEntry {
    pub fn file(name: EntryName, size: u64) -> Self {
        Self {
            name,
            node_type: NodeType::File,
            size,
            times: Times::default(),
            mode: NodeType::File.default_mode(),
        }
    }

    pub fn directory(name: EntryName) -> Self {
        Self {
            name,
            node_type: NodeType::Directory,
            size: 0,
            times: Times::default(),
            mode: NodeType::Directory.default_mode(),
        }
    }
}

/// A decoded archive that entries can be read from.
pub trait ArchiveInput: Send + Debug {
    /// Entries in the order they are stored.
    fn entries(&self) -> Vec<ArchiveEntry>;

    /// Decodes the content of a file entry.
    fn read(&self, name: &EntryName) -> Result<Vec<u8>, DriverError>;
}

/// An archive being encoded. Entries are written in call order.
pub trait ArchiveOutput: Send {
    fn put(&mut self, entry: &ArchiveEntry, data: &[u8]) -> Result<(), DriverError>;

    /// Completes the archive and returns its bytes.
    fn finish(self: Box<Self>) -> Result<Vec<u8>, DriverError>;
}

/// A format-specific archive codec.
pub trait ArchiveDriver: Send + Sync + Debug {
    /// Decodes existing archive bytes.
    ///
    /// Must fail with [`DriverError::NotAnArchive`] when `bytes` are not in
    /// this driver's format.
    fn open(&self, bytes: Vec<u8>) -> Result<Box<dyn ArchiveInput>, DriverError>;

    /// Starts encoding a new archive.
    fn create(&self) -> Result<Box<dyn ArchiveOutput>, DriverError>;
}
