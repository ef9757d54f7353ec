//! Archive management: mounting, mutating and committing one archive.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{
    AccessOptions, AccessTypes, Controller, ControllerModel, FalsePositive, Routed, RoutedResult,
    close_resources,
};
use crate::addr::{EntryName, NodePath};
use crate::archive::{
    ArchiveDriver, ArchiveEntry, ArchiveFileSystem, ArchiveInput, DriverError, Node, NodeType,
    Times, TreeError,
};
use crate::error::FsError;
use crate::lock::ReentrantRwLock;
use crate::pool::PooledBuffer;
use crate::resource::{EntryReader, EntryWriter, OutputSink};
use crate::sync::{SyncError, SyncErrorBuilder, SyncIssueKind, SyncOptions};

struct MountedArchive {
    fs: ArchiveFileSystem,
    /// Decoded original archive, `None` if it was created empty.
    input: Option<Box<dyn ArchiveInput>>,
    /// Entries whose content is still the original one from `input`.
    origin: HashSet<EntryName>,
    /// Committed writer contents not yet written to the archive.
    pending: HashMap<EntryName, PooledBuffer>,
}

impl MountedArchive {
    fn new(fs: ArchiveFileSystem, input: Option<Box<dyn ArchiveInput>>) -> Self {
        let origin = fs
            .walk()
            .into_iter()
            .filter(|(_, node)| node.is_file())
            .map(|(name, _)| name)
            .collect();
        Self {
            fs,
            input,
            origin,
            pending: HashMap::new(),
        }
    }

    /// Forgets the content of `name`; it reads as empty until written.
    fn discard_content(&mut self, name: &EntryName) {
        self.origin.remove(name);
        self.pending.remove(name);
    }

    fn content(&mut self, name: &EntryName) -> Result<Vec<u8>, ContentError> {
        if let Some(buffer) = self.pending.get_mut(name) {
            return buffer.read_all().map_err(ContentError::Io);
        }
        match &self.input {
            Some(input) if self.origin.contains(name) => input.read(name).map_err(ContentError::Driver),
            _ => Ok(Vec::new()),
        }
    }
}

enum ContentError {
    Io(std::io::Error),
    Driver(DriverError),
}

enum ArchiveState {
    Unmounted,
    Mounted(Box<MountedArchive>),
}

/// Innermost controller of an archive mount point.
///
/// Mounts the archive lazily on first access, from the bytes of the archive
/// file in the parent file system or empty when creation is requested.
/// Operations return [`Routed::RouteToParent`] when the mount point turns out
/// not to be an archive; [`FalsePositiveController`](super::FalsePositiveController)
/// handles that.
pub struct ArchiveController {
    model: ControllerModel,
    driver: Arc<dyn ArchiveDriver>,
    state: Arc<Mutex<ArchiveState>>,
}

impl ArchiveController {
    pub fn new(model: ControllerModel, driver: Arc<dyn ArchiveDriver>) -> Self {
        Self {
            model,
            driver,
            state: Arc::new(Mutex::new(ArchiveState::Unmounted)),
        }
    }

    pub fn model(&self) -> &ControllerModel {
        &self.model
    }

    /// Whether the archive file system is currently mounted.
    pub fn is_mounted(&self) -> bool {
        matches!(*self.state.lock(), ArchiveState::Mounted(_))
    }

    /// Whether there are uncommitted changes.
    pub fn is_touched(&self) -> bool {
        match &*self.state.lock() {
            ArchiveState::Mounted(m) => m.fs.is_touched(),
            ArchiveState::Unmounted => false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.model.resources().counts().total() == 0 && !self.is_touched()
    }

    fn path(&self, name: &EntryName) -> NodePath {
        self.model.mount_point().resolve(name)
    }

    /// Address of the archive file in the parent file system.
    pub(crate) fn archive_path(&self) -> Result<&NodePath, FsError> {
        self.model
            .mount_point()
            .parent_path()
            .ok_or_else(|| FsError::UnsupportedMountPoint {
                mount_point: self.model.mount_point().clone(),
                reason: "an archive needs a parent file system".to_string(),
            })
    }

    pub(crate) fn parent_controller(&self) -> Result<&Arc<dyn Controller>, FsError> {
        self.model
            .parent()
            .ok_or_else(|| FsError::UnsupportedMountPoint {
                mount_point: self.model.mount_point().clone(),
                reason: "no parent controller".to_string(),
            })
    }

    /// Runs `op` on the mounted archive, mounting it first if needed.
    ///
    /// `create` requests creating a missing archive, with the options of the
    /// triggering operation. `op` learns whether the archive was just created.
    fn with_mounted<T, F>(&self, create: Option<AccessOptions>, op: F) -> RoutedResult<T>
    where
        F: FnOnce(&mut MountedArchive, bool) -> Result<T, FsError>,
    {
        let mut state = self.state.lock();
        let mut created = false;
        if matches!(*state, ArchiveState::Unmounted) {
            match self.mount(create)? {
                Routed::Handled(mounted) => {
                    created = mounted.input.is_none();
                    *state = ArchiveState::Mounted(Box::new(mounted));
                }
                Routed::RouteToParent(signal) => return Ok(Routed::RouteToParent(signal)),
            }
        }
        match &mut *state {
            ArchiveState::Mounted(mounted) => op(mounted, created).map(Routed::Handled),
            ArchiveState::Unmounted => Err(FsError::ResourceClosed {
                path: self.path(&EntryName::root()),
            }),
        }
    }

    fn mount(&self, create: Option<AccessOptions>) -> RoutedResult<MountedArchive> {
        let parent = self.parent_controller()?;
        let archive_path = self.archive_path()?;
        let entry = archive_path.entry_name();

        let Some(node) = parent.stat(AccessOptions::empty(), entry)? else {
            let Some(options) = create else {
                return Ok(false_positive(FsError::NoSuchEntry {
                    path: archive_path.clone(),
                }));
            };
            if options.contains(AccessOptions::CREATE_PARENTS) {
                if let Some(directory) = entry.parent() {
                    parent.mknod(
                        AccessOptions::CREATE_PARENTS,
                        &directory,
                        NodeType::Directory,
                        None,
                    )?;
                }
            }
            let mut fs = ArchiveFileSystem::empty();
            fs.touch();
            info!(mount_point = %self.model.mount_point(), "created archive");
            return Ok(Routed::Handled(MountedArchive::new(fs, None)));
        };

        if node.is_directory() {
            return Ok(false_positive(FsError::IsDirectory {
                path: archive_path.clone(),
            }));
        }

        let bytes = parent.input(AccessOptions::empty(), entry)?.read_all()?;
        let input = match self.driver.open(bytes) {
            Ok(input) => input,
            Err(e @ DriverError::NotAnArchive { .. }) => {
                debug!(mount_point = %self.model.mount_point(), error = %e, "false positive archive");
                return Ok(false_positive(FsError::driver(self.model.mount_point(), e)));
            }
            Err(e) => return Err(FsError::driver(self.model.mount_point(), e)),
        };
        let fs = ArchiveFileSystem::populate(input.entries())
            .map_err(|e| FsError::driver(self.model.mount_point(), e))?;
        info!(mount_point = %self.model.mount_point(), nodes = fs.len(), "mounted archive");
        Ok(Routed::Handled(MountedArchive::new(fs, Some(input))))
    }

    pub(crate) fn stat(&self, name: &EntryName) -> RoutedResult<Option<Node>> {
        self.with_mounted(None, |m, _| Ok(m.fs.stat(name)))
    }

    pub(crate) fn check_access(&self, name: &EntryName, types: AccessTypes) -> RoutedResult<()> {
        let path = self.path(name);
        self.with_mounted(None, |m, _| {
            let node = m.fs.stat(name).ok_or_else(|| FsError::NoSuchEntry { path: path.clone() })?;
            if types.granted_by(node.mode) {
                Ok(())
            } else {
                Err(FsError::AccessDenied { path, types })
            }
        })
    }

    pub(crate) fn set_time(&self, name: &EntryName, times: &Times) -> RoutedResult<()> {
        self.with_mounted(None, |m, _| Ok(m.fs.set_times(name, times)?))
    }

    pub(crate) fn input(&self, name: &EntryName) -> RoutedResult<EntryReader> {
        let path = self.path(name);
        let mount_point = self.model.mount_point();
        let data = self.with_mounted(None, |m, _| {
            match m.fs.stat(name) {
                None => return Err(FsError::NoSuchEntry { path: path.clone() }),
                Some(node) if node.is_directory() => {
                    return Err(FsError::IsDirectory { path: path.clone() });
                }
                Some(_) => {}
            }
            m.content(name).map_err(|e| match e {
                ContentError::Io(e) => FsError::io(&path, e),
                ContentError::Driver(e) => FsError::driver(mount_point, e),
            })
        })?;
        Ok(match data {
            Routed::Handled(data) => Routed::Handled(EntryReader::new(
                path,
                Arc::from(data),
                Some(self.model.resources()),
            )),
            Routed::RouteToParent(signal) => Routed::RouteToParent(signal),
        })
    }

    pub(crate) fn output(
        &self,
        options: AccessOptions,
        name: &EntryName,
        template: Option<&Node>,
    ) -> RoutedResult<EntryWriter> {
        let path = self.path(name);
        let create = options
            .contains(AccessOptions::CREATE_PARENTS)
            .then_some(options);
        let mount_point = self.model.mount_point();
        let pool = self.model.pool();
        let buffer = self.with_mounted(create, |m, _| {
            match m.fs.stat(name) {
                Some(node) if node.is_directory() => {
                    return Err(FsError::IsDirectory { path: path.clone() });
                }
                Some(_) if options.contains(AccessOptions::EXCLUSIVE) => {
                    return Err(TreeError::NodeExists { name: name.clone() }.into());
                }
                Some(_) => {}
                None => m.fs.mknod(
                    name,
                    NodeType::File,
                    template,
                    options & AccessOptions::CREATE_PARENTS,
                )?,
            }
            let mut buffer = PooledBuffer::allocate(pool).map_err(|e| FsError::io(&path, e))?;
            if options.contains(AccessOptions::APPEND) {
                let existing = m.content(name).map_err(|e| match e {
                    ContentError::Io(e) => FsError::io(&path, e),
                    ContentError::Driver(e) => FsError::driver(mount_point, e),
                })?;
                buffer.append(&existing).map_err(|e| FsError::io(&path, e))?;
            }
            Ok(buffer)
        })?;
        let buffer = match buffer {
            Routed::Handled(buffer) => buffer,
            Routed::RouteToParent(signal) => return Ok(Routed::RouteToParent(signal)),
        };
        let sink = ArchiveSink {
            lock: Arc::clone(self.model.lock()),
            state: Arc::clone(&self.state),
            name: name.clone(),
            path: path.clone(),
        };
        Ok(Routed::Handled(EntryWriter::new(
            path,
            buffer,
            Box::new(sink),
            Some(self.model.resources()),
        )))
    }

    pub(crate) fn mknod(
        &self,
        options: AccessOptions,
        name: &EntryName,
        node_type: NodeType,
        template: Option<&Node>,
    ) -> RoutedResult<()> {
        let create = if name.is_root() {
            (node_type == NodeType::Directory).then_some(options)
        } else {
            options
                .contains(AccessOptions::CREATE_PARENTS)
                .then_some(options)
        };
        self.with_mounted(create, |m, created| {
            if name.is_root() && created && node_type == NodeType::Directory {
                return Ok(());
            }
            m.fs.mknod(name, node_type, template, options)?;
            m.discard_content(name);
            Ok(())
        })
    }

    pub(crate) fn unlink(&self, name: &EntryName) -> RoutedResult<()> {
        if !name.is_root() {
            return self.with_mounted(None, |m, _| {
                m.fs.unlink(name)?;
                m.discard_content(name);
                Ok(())
            });
        }

        // Unlinking the root deletes the archive file itself.
        let routed = self.with_mounted(None, |m, _| {
            if m.fs.is_empty() {
                Ok(())
            } else {
                Err(TreeError::DirectoryNotEmpty { name: name.clone() }.into())
            }
        })?;
        if let Routed::RouteToParent(signal) = routed {
            return Ok(Routed::RouteToParent(signal));
        }
        if self.model.resources().counts().total() > 0 {
            return Err(FsError::UnsupportedMountPoint {
                mount_point: self.model.mount_point().clone(),
                reason: "cannot delete an archive with open resources".to_string(),
            });
        }
        let parent = self.parent_controller()?;
        let entry = self.archive_path()?.entry_name();
        if parent.stat(AccessOptions::empty(), entry)?.is_some() {
            parent.unlink(AccessOptions::empty(), entry)?;
        }
        *self.state.lock() = ArchiveState::Unmounted;
        info!(mount_point = %self.model.mount_point(), "deleted archive");
        Ok(Routed::Handled(()))
    }

    pub(crate) fn sync(&self, options: SyncOptions) -> Result<(), SyncError> {
        let mut builder = SyncErrorBuilder::new();
        if !close_resources(&self.model, options, &mut builder) {
            return builder.check();
        }

        let mut state = self.state.lock();
        let ArchiveState::Mounted(mut mounted) = std::mem::replace(&mut *state, ArchiveState::Unmounted)
        else {
            return builder.check();
        };
        if options.contains(SyncOptions::ABORT_CHANGES) {
            if mounted.fs.is_touched() {
                info!(mount_point = %self.model.mount_point(), "discarded archive changes");
            }
        } else if mounted.fs.is_touched() {
            match self.commit(&mut mounted) {
                Ok(()) => info!(mount_point = %self.model.mount_point(), "committed archive"),
                Err(e) => {
                    builder.push(self.model.mount_point(), SyncIssueKind::Commit(e));
                    *state = ArchiveState::Mounted(mounted);
                }
            }
        }
        builder.check()
    }

    /// Encodes the tree and writes the archive bytes through the parent.
    fn commit(&self, mounted: &mut MountedArchive) -> Result<(), FsError> {
        let mount_point = self.model.mount_point();
        let mut output = self
            .driver
            .create()
            .map_err(|e| FsError::driver(mount_point, e))?;
        for (name, node) in mounted.fs.walk() {
            let data = match node.node_type {
                NodeType::Directory => Vec::new(),
                NodeType::File => mounted.content(&name).map_err(|e| match e {
                    ContentError::Io(e) => FsError::io(self.path(&name), e),
                    ContentError::Driver(e) => FsError::driver(mount_point, e),
                })?,
            };
            let entry = ArchiveEntry {
                size: data.len() as u64,
                times: node.times,
                mode: node.mode,
                node_type: node.node_type,
                name,
            };
            output
                .put(&entry, &data)
                .map_err(|e| FsError::driver(mount_point, e))?;
        }
        let bytes = output
            .finish()
            .map_err(|e| FsError::driver(mount_point, e))?;

        let parent = self.parent_controller()?;
        let archive_path = self.archive_path()?;
        let mut writer = parent.output(
            AccessOptions::CREATE_PARENTS,
            archive_path.entry_name(),
            None,
        )?;
        writer
            .write_all(&bytes)
            .map_err(|e| FsError::io(archive_path, e))?;
        writer.close()?;
        debug!(%mount_point, bytes = bytes.len(), "wrote archive");
        Ok(())
    }
}

fn false_positive<T>(cause: FsError) -> Routed<T> {
    Routed::RouteToParent(FalsePositive { cause })
}

impl fmt::Debug for ArchiveController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveController")
            .field("mount_point", self.model.mount_point())
            .field("driver", &self.driver)
            .field("mounted", &self.is_mounted())
            .finish()
    }
}

/// Receives the content of writers on archive entries.
struct ArchiveSink {
    lock: Arc<ReentrantRwLock>,
    state: Arc<Mutex<ArchiveState>>,
    name: EntryName,
    path: NodePath,
}

impl OutputSink for ArchiveSink {
    fn commit(&self, buffer: PooledBuffer) -> Result<(), FsError> {
        let _guard = self.lock.write()?;
        let mut state = self.state.lock();
        let ArchiveState::Mounted(mounted) = &mut *state else {
            return Err(FsError::ResourceClosed {
                path: self.path.clone(),
            });
        };
        match mounted.fs.stat(&self.name) {
            Some(node) if node.is_directory() => {
                return Err(FsError::IsDirectory {
                    path: self.path.clone(),
                });
            }
            Some(_) => {}
            None => mounted.fs.mknod(
                &self.name,
                NodeType::File,
                None,
                AccessOptions::CREATE_PARENTS,
            )?,
        }
        mounted.fs.set_size(&self.name, buffer.len())?;
        mounted
            .fs
            .set_times(&self.name, &Times::modified(SystemTime::now()))?;
        mounted.origin.remove(&self.name);
        mounted.pending.insert(self.name.clone(), buffer);
        Ok(())
    }
}
