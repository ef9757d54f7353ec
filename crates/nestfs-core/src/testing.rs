//! Support for tests of code built on the kernel.
//!
//! [`JsonArchiveDriver`] stores archives as a small JSON document, which
//! keeps fixtures readable and makes corrupt archives easy to produce.

use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::addr::{EntryName, MountPoint};
use crate::archive::{
    ArchiveDriver, ArchiveEntry, ArchiveInput, ArchiveOutput, DriverError, NodeType, Times,
};
use crate::config::KernelConfig;
use crate::detector::ArchiveDetector;
use crate::error::FsError;
use crate::federation::Federation;
use crate::manager::{DriverRegistry, Manager};
use crate::storage::MemoryStore;

/// First field of every JSON test archive.
pub const ARCHIVE_MAGIC: &str = "nestfs-json-archive/1";

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    magic: String,
    entries: Vec<StoredEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    name: String,
    directory: bool,
    mode: u32,
    #[serde(default)]
    modified: Option<SystemTime>,
    #[serde(default)]
    data: Vec<u8>,
}

impl StoredEntry {
    fn to_entry(&self) -> Result<ArchiveEntry, DriverError> {
        let name = EntryName::new(&self.name).map_err(|e| DriverError::Codec {
            reason: e.to_string(),
        })?;
        Ok(ArchiveEntry {
            name,
            node_type: if self.directory {
                NodeType::Directory
            } else {
                NodeType::File
            },
            size: self.data.len() as u64,
            times: Times {
                modified: self.modified,
                ..Times::default()
            },
            mode: self.mode,
        })
    }
}

/// Archive driver over JSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonArchiveDriver;

impl ArchiveDriver for JsonArchiveDriver {
    fn open(&self, bytes: Vec<u8>) -> Result<Box<dyn ArchiveInput>, DriverError> {
        let document: Document =
            serde_json::from_slice(&bytes).map_err(|e| DriverError::NotAnArchive {
                reason: e.to_string(),
            })?;
        if document.magic != ARCHIVE_MAGIC {
            return Err(DriverError::NotAnArchive {
                reason: format!("unexpected magic '{}'", document.magic),
            });
        }
        let entries = document
            .entries
            .iter()
            .map(StoredEntry::to_entry)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Box::new(JsonInput {
            entries,
            stored: document.entries,
        }))
    }

    fn create(&self) -> Result<Box<dyn ArchiveOutput>, DriverError> {
        Ok(Box::new(JsonOutput::default()))
    }
}

#[derive(Debug)]
struct JsonInput {
    entries: Vec<ArchiveEntry>,
    stored: Vec<StoredEntry>,
}

impl ArchiveInput for JsonInput {
    fn entries(&self) -> Vec<ArchiveEntry> {
        self.entries.clone()
    }

    fn read(&self, name: &EntryName) -> Result<Vec<u8>, DriverError> {
        // The last of duplicate entries wins, as in the mounted tree.
        self.entries
            .iter()
            .zip(&self.stored)
            .rev()
            .find(|(entry, _)| entry.name == *name && entry.node_type == NodeType::File)
            .map(|(_, stored)| stored.data.clone())
            .ok_or_else(|| DriverError::NoSuchEntry { name: name.clone() })
    }
}

#[derive(Debug, Default)]
struct JsonOutput {
    entries: Vec<StoredEntry>,
}

impl ArchiveOutput for JsonOutput {
    fn put(&mut self, entry: &ArchiveEntry, data: &[u8]) -> Result<(), DriverError> {
        self.entries.push(StoredEntry {
            name: entry.name.to_string(),
            directory: entry.node_type == NodeType::Directory,
            mode: entry.mode,
            modified: entry.times.modified,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>, DriverError> {
        let document = Document {
            magic: ARCHIVE_MAGIC.to_string(),
            entries: self.entries,
        };
        serde_json::to_vec_pretty(&document).map_err(|e| DriverError::Codec {
            reason: e.to_string(),
        })
    }
}

/// Reads JSON archives but fails to write any.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrokenArchiveDriver;

impl ArchiveDriver for BrokenArchiveDriver {
    fn open(&self, bytes: Vec<u8>) -> Result<Box<dyn ArchiveInput>, DriverError> {
        JsonArchiveDriver.open(bytes)
    }

    fn create(&self) -> Result<Box<dyn ArchiveOutput>, DriverError> {
        Err(DriverError::Codec {
            reason: "encoding is not supported".to_string(),
        })
    }
}

/// Encodes a JSON archive. Names ending in `/` become directories.
pub fn encode_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let entries: Vec<_> = entries
        .iter()
        .map(|&(name, data)| {
            let node_type = if name.ends_with('/') {
                NodeType::Directory
            } else {
                NodeType::File
            };
            (name, node_type.default_mode(), data)
        })
        .collect();
    encode_archive_with_modes(&entries)
}

/// Like [`encode_archive`], with an explicit mode per entry. Entries are
/// stored in the given order, duplicates included.
pub fn encode_archive_with_modes(entries: &[(&str, u32, &[u8])]) -> Vec<u8> {
    let document = Document {
        magic: ARCHIVE_MAGIC.to_string(),
        entries: entries
            .iter()
            .map(|&(name, mode, data)| StoredEntry {
                name: name.trim_end_matches('/').to_string(),
                directory: name.ends_with('/'),
                mode,
                modified: None,
                data: data.to_vec(),
            })
            .collect(),
    };
    serde_json::to_vec(&document).unwrap_or_default()
}

/// Memory and local storage plus JSON archives under `zip`, `jar` and `tar`,
/// and [`BrokenArchiveDriver`] under `broken`.
pub fn test_registry(store: Arc<MemoryStore>) -> Result<DriverRegistry, FsError> {
    Ok(DriverRegistry::with_defaults(store)
        .with_archive("zip", JsonArchiveDriver)?
        .with_archive("jar", JsonArchiveDriver)?
        .with_archive("tar", JsonArchiveDriver)?
        .with_archive("broken", BrokenArchiveDriver)?)
}

/// Detects every archive scheme of [`test_registry`] by its own suffix.
pub fn test_detector() -> Result<ArchiveDetector, FsError> {
    Ok(ArchiveDetector::new()
        .with("zip", "zip")?
        .with("jar", "jar")?
        .with("tar", "tar")?
        .with("broken", "broken")?)
}

/// A federation rooted at `mem:/` over `store`.
pub fn test_federation(store: Arc<MemoryStore>, config: KernelConfig) -> Result<Federation, FsError> {
    let manager = Arc::new(Manager::new(test_registry(store)?, config));
    Federation::new(manager, MountPoint::new("mem:/")?, test_detector()?)
}
