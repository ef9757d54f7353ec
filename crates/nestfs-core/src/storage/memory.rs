//! In-process storage for the `mem:` scheme.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use super::StorageDriver;
use crate::addr::{EntryName, NodePath};
use crate::archive::{ArchiveFileSystem, Node, NodeType, Times, TreeError};
use crate::controller::{
    AccessOptions, AccessTypes, Controller, ControllerModel, close_resources,
};
use crate::error::FsError;
use crate::pool::PooledBuffer;
use crate::resource::{EntryReader, EntryWriter, OutputSink};
use crate::sync::{SyncError, SyncErrorBuilder, SyncOptions};

#[derive(Debug, Default)]
struct StoreInner {
    tree: ArchiveFileSystem,
    contents: HashMap<EntryName, Arc<[u8]>>,
}

/// A tree of files and directories kept in memory.
///
/// One store backs every `mem:` mount point of a [`MemoryDriver`]; names are
/// absolute paths without the leading separator.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stat(&self, name: &EntryName) -> Option<Node> {
        self.inner.read().tree.stat(name)
    }

    pub fn mknod(
        &self,
        name: &EntryName,
        node_type: NodeType,
        template: Option<&Node>,
        options: AccessOptions,
    ) -> Result<(), TreeError> {
        let mut inner = self.inner.write();
        inner.tree.mknod(name, node_type, template, options)?;
        inner.contents.remove(name);
        Ok(())
    }

    pub fn unlink(&self, name: &EntryName) -> Result<(), TreeError> {
        let mut inner = self.inner.write();
        inner.tree.unlink(name)?;
        inner.contents.remove(name);
        Ok(())
    }

    pub fn set_times(&self, name: &EntryName, times: &Times) -> Result<(), TreeError> {
        self.inner.write().tree.set_times(name, times)
    }

    /// Content of a file, `None` if there is no file named `name`.
    pub fn read(&self, name: &EntryName) -> Option<Arc<[u8]>> {
        let inner = self.inner.read();
        match inner.tree.stat(name) {
            Some(node) if node.is_file() => Some(
                inner
                    .contents
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| Arc::from(Vec::new())),
            ),
            _ => None,
        }
    }

    /// Replaces the content of a file, creating it if needed.
    pub fn write(
        &self,
        name: &EntryName,
        data: Vec<u8>,
        options: AccessOptions,
    ) -> Result<(), TreeError> {
        let mut inner = self.inner.write();
        if inner.tree.stat(name).is_none() {
            inner.tree.mknod(
                name,
                NodeType::File,
                None,
                options & AccessOptions::CREATE_PARENTS,
            )?;
        }
        inner.tree.set_size(name, data.len() as u64)?;
        inner
            .tree
            .set_times(name, &Times::modified(SystemTime::now()))?;
        inner.contents.insert(name.clone(), Arc::from(data));
        Ok(())
    }

    /// Writes a file by path, creating missing parent directories.
    pub fn put_file(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
        let name = EntryName::new(path)?;
        Ok(self.write(&name, data.to_vec(), AccessOptions::CREATE_PARENTS)?)
    }

    /// Reads a file by path.
    pub fn get_file(&self, path: &str) -> Option<Vec<u8>> {
        let name = EntryName::new(path).ok()?;
        self.read(&name).map(|data| data.to_vec())
    }
}

/// Driver of the `mem:` scheme.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    store: Arc<MemoryStore>,
}

impl MemoryDriver {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

impl StorageDriver for MemoryDriver {
    fn new_controller(&self, model: ControllerModel) -> Result<Box<dyn Controller>, FsError> {
        Ok(Box::new(MemoryController::new(model, Arc::clone(&self.store))?))
    }
}

/// Controller of one `mem:` directory.
pub struct MemoryController {
    model: ControllerModel,
    store: Arc<MemoryStore>,
    base: EntryName,
}

impl MemoryController {
    pub fn new(model: ControllerModel, store: Arc<MemoryStore>) -> Result<Self, FsError> {
        let path = model
            .mount_point()
            .hierarchical_path()
            .ok_or_else(|| FsError::UnsupportedMountPoint {
                mount_point: model.mount_point().clone(),
                reason: "not a hierarchical root".to_string(),
            })?;
        let base = EntryName::new(path)?;
        Ok(Self { model, store, base })
    }

    fn full(&self, name: &EntryName) -> Result<EntryName, FsError> {
        Ok(self.base.join(name.as_str())?)
    }

    fn path(&self, name: &EntryName) -> NodePath {
        self.model.mount_point().resolve(name)
    }
}

impl fmt::Debug for MemoryController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryController")
            .field("mount_point", self.model.mount_point())
            .finish_non_exhaustive()
    }
}

impl Controller for MemoryController {
    fn model(&self) -> &ControllerModel {
        &self.model
    }

    fn stat(&self, _options: AccessOptions, name: &EntryName) -> Result<Option<Node>, FsError> {
        Ok(self.store.stat(&self.full(name)?))
    }

    fn check_access(
        &self,
        _options: AccessOptions,
        name: &EntryName,
        types: AccessTypes,
    ) -> Result<(), FsError> {
        let node = self
            .store
            .stat(&self.full(name)?)
            .ok_or_else(|| FsError::NoSuchEntry {
                path: self.path(name),
            })?;
        if types.granted_by(node.mode) {
            Ok(())
        } else {
            Err(FsError::AccessDenied {
                path: self.path(name),
                types,
            })
        }
    }

    fn set_time(&self, _options: AccessOptions, name: &EntryName, times: &Times) -> Result<(), FsError> {
        Ok(self.store.set_times(&self.full(name)?, times)?)
    }

    fn input(&self, _options: AccessOptions, name: &EntryName) -> Result<EntryReader, FsError> {
        let full = self.full(name)?;
        match self.store.stat(&full) {
            None => Err(FsError::NoSuchEntry {
                path: self.path(name),
            }),
            Some(node) if node.is_directory() => Err(FsError::IsDirectory {
                path: self.path(name),
            }),
            Some(_) => {
                let data = self.store.read(&full).ok_or_else(|| FsError::NoSuchEntry {
                    path: self.path(name),
                })?;
                Ok(EntryReader::new(
                    self.path(name),
                    data,
                    Some(self.model.resources()),
                ))
            }
        }
    }

    fn output(
        &self,
        options: AccessOptions,
        name: &EntryName,
        template: Option<&Node>,
    ) -> Result<EntryWriter, FsError> {
        let full = self.full(name)?;
        let path = self.path(name);
        match self.store.stat(&full) {
            Some(node) if node.is_directory() => return Err(FsError::IsDirectory { path }),
            Some(_) if options.contains(AccessOptions::EXCLUSIVE) => {
                return Err(TreeError::NodeExists { name: name.clone() }.into());
            }
            Some(_) => {}
            None => self.store.mknod(
                &full,
                NodeType::File,
                template,
                options & AccessOptions::CREATE_PARENTS,
            )?,
        }

        let mut buffer =
            PooledBuffer::allocate(self.model.pool()).map_err(|e| FsError::io(&path, e))?;
        if options.contains(AccessOptions::APPEND) {
            if let Some(existing) = self.store.read(&full) {
                buffer.append(&existing).map_err(|e| FsError::io(&path, e))?;
            }
        }
        let sink = MemorySink {
            store: Arc::clone(&self.store),
            name: full,
            path: path.clone(),
        };
        Ok(EntryWriter::new(
            path,
            buffer,
            Box::new(sink),
            Some(self.model.resources()),
        ))
    }

    fn mknod(
        &self,
        options: AccessOptions,
        name: &EntryName,
        node_type: NodeType,
        template: Option<&Node>,
    ) -> Result<(), FsError> {
        Ok(self
            .store
            .mknod(&self.full(name)?, node_type, template, options)?)
    }

    fn unlink(&self, _options: AccessOptions, name: &EntryName) -> Result<(), FsError> {
        Ok(self.store.unlink(&self.full(name)?)?)
    }

    fn sync(&self, options: SyncOptions) -> Result<(), SyncError> {
        let mut builder = SyncErrorBuilder::new();
        close_resources(&self.model, options, &mut builder);
        builder.check()
    }
}

struct MemorySink {
    store: Arc<MemoryStore>,
    name: EntryName,
    path: NodePath,
}

impl OutputSink for MemorySink {
    fn commit(&self, mut buffer: PooledBuffer) -> Result<(), FsError> {
        let data = buffer.read_all().map_err(|e| FsError::io(&self.path, e))?;
        Ok(self
            .store
            .write(&self.name, data, AccessOptions::CREATE_PARENTS)?)
    }
}
