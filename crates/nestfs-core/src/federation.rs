//! Path based access to a federation of file systems.
//!
//! A [`Federation`] resolves slash separated paths against a root mount
//! point. Every path segment the [`ArchiveDetector`] recognizes becomes a
//! nested archive mount point, so `a/b.zip/c.txt` under `mem:/` addresses
//! entry `c.txt` of `zip:mem:/a/b.zip!/`.

use std::io::Write;
use std::sync::Arc;

use tracing::instrument;

use crate::addr::{EntryName, MountPoint, NodePath};
use crate::archive::{Node, NodeType, Times};
use crate::controller::{AccessOptions, AccessTypes, Controller};
use crate::detector::ArchiveDetector;
use crate::error::FsError;
use crate::manager::Manager;
use crate::resource::{EntryReader, EntryWriter};
use crate::sync::{SyncError, SyncOptions};

#[derive(Debug, Clone)]
pub struct Federation {
    manager: Arc<Manager>,
    root: MountPoint,
    detector: ArchiveDetector,
}

impl Federation {
    /// Creates a facade over `root`, which must be a hierarchical root.
    pub fn new(
        manager: Arc<Manager>,
        root: MountPoint,
        detector: ArchiveDetector,
    ) -> Result<Self, FsError> {
        if !root.is_root() {
            return Err(FsError::UnsupportedMountPoint {
                mount_point: root,
                reason: "a federation must be rooted in a hierarchical file system".to_string(),
            });
        }
        Ok(Self {
            manager,
            root,
            detector,
        })
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn root(&self) -> &MountPoint {
        &self.root
    }

    pub fn detector(&self) -> &ArchiveDetector {
        &self.detector
    }

    /// Resolves a path relative to the root into a node address.
    pub fn resolve(&self, path: &str) -> Result<NodePath, FsError> {
        let name = EntryName::new(path)?;
        let mut mount_point = self.root.clone();
        let mut pending: Vec<&str> = Vec::new();
        for segment in name.segments() {
            pending.push(segment);
            if let Some(scheme) = self.detector.detect(segment) {
                let archive = locate(&mount_point, EntryName::new(&pending.join("/"))?)?;
                mount_point = MountPoint::nested(scheme.clone(), archive);
                pending.clear();
            }
        }
        locate(&mount_point, EntryName::new(&pending.join("/"))?)
    }

    fn open(&self, path: &str) -> Result<(Arc<dyn Controller>, EntryName), FsError> {
        let (mount_point, name) = self.resolve(path)?.into_parts();
        Ok((self.manager.controller(&mount_point)?, name))
    }

    #[instrument(level = "debug", skip(self))]
    pub fn stat(&self, path: &str) -> Result<Option<Node>, FsError> {
        let (controller, name) = self.open(path)?;
        controller.stat(AccessOptions::empty(), &name)
    }

    pub fn exists(&self, path: &str) -> Result<bool, FsError> {
        Ok(self.stat(path)?.is_some())
    }

    pub fn check_access(&self, path: &str, types: AccessTypes) -> Result<(), FsError> {
        let (controller, name) = self.open(path)?;
        controller.check_access(AccessOptions::empty(), &name, types)
    }

    pub fn set_time(&self, path: &str, times: &Times) -> Result<(), FsError> {
        let (controller, name) = self.open(path)?;
        controller.set_time(AccessOptions::empty(), &name, times)
    }

    /// Opens a file for reading.
    pub fn read(&self, options: AccessOptions, path: &str) -> Result<EntryReader, FsError> {
        let (controller, name) = self.open(path)?;
        controller.input(options, &name)
    }

    pub fn read_to_vec(&self, path: &str) -> Result<Vec<u8>, FsError> {
        self.read(AccessOptions::empty(), path)?.read_all()
    }

    /// Opens a file for writing.
    pub fn write(&self, options: AccessOptions, path: &str) -> Result<EntryWriter, FsError> {
        let (controller, name) = self.open(path)?;
        controller.output(options, &name, None)
    }

    /// Replaces the content of a file, creating it and its parents.
    #[instrument(level = "debug", skip(self, data), fields(bytes = data.len()))]
    pub fn write_all(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
        let mut writer = self.write(AccessOptions::CREATE_PARENTS, path)?;
        writer
            .write_all(data)
            .map_err(|e| FsError::io(writer.path(), e))?;
        writer.close()
    }

    pub fn mknod(&self, options: AccessOptions, path: &str, node_type: NodeType) -> Result<(), FsError> {
        let (controller, name) = self.open(path)?;
        controller.mknod(options, &name, node_type, None)
    }

    pub fn unlink(&self, path: &str) -> Result<(), FsError> {
        let (controller, name) = self.open(path)?;
        controller.unlink(AccessOptions::empty(), &name)
    }

    /// Member names of a directory.
    pub fn list(&self, path: &str) -> Result<Vec<String>, FsError> {
        let address = self.resolve(path)?;
        let node = self.stat(path)?.ok_or_else(|| FsError::NoSuchEntry {
            path: address.clone(),
        })?;
        node.members
            .ok_or(FsError::NotADirectory { path: address })
    }

    /// Syncs every mount point within the root.
    pub fn sync(&self, options: SyncOptions) -> Result<(), SyncError> {
        self.manager.sync(options, Some(&self.root))
    }

    /// Commits all changes and releases every archive within the root.
    pub fn umount(&self) -> Result<(), SyncError> {
        self.sync(SyncOptions::UMOUNT)
    }
}

/// Addresses `name` within `mount_point`, descending into the directory's
/// own hierarchical root for roots.
fn locate(mount_point: &MountPoint, name: EntryName) -> Result<NodePath, FsError> {
    let directory = name.parent().filter(|parent| !parent.is_root());
    match directory {
        Some(directory) => match mount_point.child_root(directory.as_str())? {
            Some(child) => {
                let base = EntryName::new(name.base_name())?;
                Ok(child.resolve(&base))
            }
            None => Ok(mount_point.resolve(&name)),
        },
        None => Ok(mount_point.resolve(&name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::manager::DriverRegistry;
    use crate::storage::MemoryStore;

    fn federation() -> Federation {
        let drivers = DriverRegistry::with_defaults(Arc::new(MemoryStore::new()));
        let manager = Arc::new(Manager::new(drivers, KernelConfig::default()));
        let detector = ArchiveDetector::new().with("zip", "zip").unwrap();
        Federation::new(manager, MountPoint::new("mem:/").unwrap(), detector).unwrap()
    }

    #[test]
    fn test_resolve_plain_paths() {
        let federation = federation();
        assert_eq!(federation.resolve("").unwrap().to_string(), "mem:/");
        assert_eq!(federation.resolve("x.txt").unwrap().to_string(), "mem:/x.txt");
        let path = federation.resolve("a/b/x.txt").unwrap();
        assert_eq!(path.mount_point().uri(), "mem:/a/b/");
        assert_eq!(path.entry_name().as_str(), "x.txt");
    }

    #[test]
    fn test_resolve_archive_paths() {
        let federation = federation();
        let path = federation.resolve("a/b.zip/c/d.txt").unwrap();
        assert_eq!(path.mount_point().uri(), "zip:mem:/a/b.zip!/");
        assert_eq!(path.entry_name().as_str(), "c/d.txt");

        let root = federation.resolve("a/b.zip/").unwrap();
        assert_eq!(root.mount_point().uri(), "zip:mem:/a/b.zip!/");
        assert!(root.entry_name().is_root());

        let nested = federation.resolve("x.zip/y.zip/z").unwrap();
        assert_eq!(nested.mount_point().uri(), "zip:zip:mem:/x.zip!/y.zip!/");
        assert_eq!(nested.mount_point().depth(), 2);
    }

    #[test]
    fn test_resolved_paths_round_trip_through_parsing() {
        let federation = federation();
        let path = federation.resolve("a/b.zip/c.txt").unwrap();
        assert_eq!(NodePath::new(&path.to_string()).unwrap(), path);
    }

    #[test]
    fn test_resolve_rejects_escape() {
        assert!(matches!(
            federation().resolve("../x"),
            Err(FsError::Address(_))
        ));
    }

    #[test]
    fn test_plain_files_and_listing() {
        let federation = federation();
        federation.write_all("docs/readme.txt", b"hello").unwrap();
        assert_eq!(federation.read_to_vec("docs/readme.txt").unwrap(), b"hello");
        assert_eq!(federation.list("docs").unwrap(), vec!["readme.txt"]);
        assert!(matches!(
            federation.list("docs/readme.txt"),
            Err(FsError::NotADirectory { .. })
        ));
        federation.unlink("docs/readme.txt").unwrap();
        assert!(!federation.exists("docs/readme.txt").unwrap());
    }
}
