//! Storage for the `file:` scheme.

use std::fmt;
use std::fs::{self, File, FileTimes, Metadata, OpenOptions, Permissions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::trace;
use url::Url;

use super::StorageDriver;
use crate::addr::{EntryName, NodePath};
use crate::archive::{Node, NodeType, Times, TreeError};
use crate::controller::{
    AccessOptions, AccessTypes, Controller, ControllerModel, close_resources,
};
use crate::error::FsError;
use crate::pool::PooledBuffer;
use crate::resource::{EntryReader, EntryWriter, OutputSink};
use crate::sync::{SyncError, SyncErrorBuilder, SyncOptions};

/// Driver of the `file:` scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalDriver;

impl StorageDriver for LocalDriver {
    fn new_controller(&self, model: ControllerModel) -> Result<Box<dyn Controller>, FsError> {
        Ok(Box::new(LocalController::new(model)?))
    }
}

/// Controller of one local directory.
pub struct LocalController {
    model: ControllerModel,
    root: PathBuf,
}

impl LocalController {
    pub fn new(model: ControllerModel) -> Result<Self, FsError> {
        let unsupported = |reason: &str| FsError::UnsupportedMountPoint {
            mount_point: model.mount_point().clone(),
            reason: reason.to_string(),
        };
        let url = Url::parse(model.mount_point().uri()).map_err(|e| unsupported(&e.to_string()))?;
        let root = url
            .to_file_path()
            .map_err(|()| unsupported("not a local file path"))?;
        Ok(Self { model, root })
    }

    /// Local directory of this mount point.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn local(&self, name: &EntryName) -> PathBuf {
        if name.is_root() {
            self.root.clone()
        } else {
            self.root.join(name.as_str())
        }
    }

    fn path(&self, name: &EntryName) -> NodePath {
        self.model.mount_point().resolve(name)
    }

    fn io(&self, name: &EntryName, source: io::Error) -> FsError {
        FsError::io(self.path(name), source)
    }

    fn metadata(&self, name: &EntryName) -> Result<Option<Metadata>, FsError> {
        match fs::metadata(self.local(name)) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io(name, e)),
        }
    }

    /// Makes sure the parent directory of `name` exists.
    fn prepare_parent(&self, options: AccessOptions, name: &EntryName) -> Result<(), FsError> {
        let Some(parent) = name.parent() else {
            return Ok(());
        };
        let local = self.local(&parent);
        if options.contains(AccessOptions::CREATE_PARENTS) {
            return fs::create_dir_all(&local).map_err(|e| self.io(&parent, e));
        }
        match fs::metadata(&local) {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(FsError::NotADirectory {
                path: self.path(&parent),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(TreeError::NoSuchParent { name: name.clone() }.into())
            }
            Err(e) => Err(self.io(&parent, e)),
        }
    }

    fn create_file(
        &self,
        options: AccessOptions,
        name: &EntryName,
        template: Option<&Node>,
    ) -> Result<(), FsError> {
        self.prepare_parent(options, name)?;
        let local = self.local(name);
        let file = if options.contains(AccessOptions::EXCLUSIVE) {
            OpenOptions::new().write(true).create_new(true).open(&local)
        } else {
            File::create(&local)
        }
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => TreeError::NodeExists { name: name.clone() }.into(),
            _ => self.io(name, e),
        })?;
        if let Some(template) = template {
            apply_template(&file, template).map_err(|e| self.io(name, e))?;
        }
        Ok(())
    }
}

impl fmt::Debug for LocalController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalController")
            .field("mount_point", self.model.mount_point())
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

fn to_node(name: &EntryName, local: &Path, metadata: &Metadata) -> io::Result<Node> {
    let node_type = if metadata.is_dir() {
        NodeType::Directory
    } else {
        NodeType::File
    };
    let members = if metadata.is_dir() {
        let mut members = fs::read_dir(local)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<io::Result<Vec<_>>>()?;
        members.sort();
        Some(members)
    } else {
        None
    };
    Ok(Node {
        name: name.base_name().to_string(),
        node_type,
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        times: Times {
            modified: metadata.modified().ok(),
            accessed: metadata.accessed().ok(),
            created: metadata.created().ok(),
        },
        mode: mode_of(metadata, node_type),
        members,
    })
}

#[cfg(unix)]
fn mode_of(metadata: &Metadata, _node_type: NodeType) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &Metadata, node_type: NodeType) -> u32 {
    let mode = node_type.default_mode();
    if metadata.permissions().readonly() {
        mode & !0o222
    } else {
        mode
    }
}

fn apply_template(file: &File, template: &Node) -> io::Result<()> {
    set_file_times(file, &template.times)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(template.mode))?;
    }
    Ok(())
}

fn set_file_times(file: &File, times: &Times) -> io::Result<()> {
    let mut file_times = FileTimes::new();
    if let Some(modified) = times.modified {
        file_times = file_times.set_modified(modified);
    }
    if let Some(accessed) = times.accessed {
        file_times = file_times.set_accessed(accessed);
    }
    file.set_times(file_times)
}

impl Controller for LocalController {
    fn model(&self) -> &ControllerModel {
        &self.model
    }

    fn stat(&self, _options: AccessOptions, name: &EntryName) -> Result<Option<Node>, FsError> {
        let Some(metadata) = self.metadata(name)? else {
            return Ok(None);
        };
        to_node(name, &self.local(name), &metadata)
            .map(Some)
            .map_err(|e| self.io(name, e))
    }

    fn check_access(
        &self,
        _options: AccessOptions,
        name: &EntryName,
        types: AccessTypes,
    ) -> Result<(), FsError> {
        let metadata = self.metadata(name)?.ok_or_else(|| FsError::NoSuchEntry {
            path: self.path(name),
        })?;
        let node_type = if metadata.is_dir() {
            NodeType::Directory
        } else {
            NodeType::File
        };
        if types.granted_by(mode_of(&metadata, node_type)) {
            Ok(())
        } else {
            Err(FsError::AccessDenied {
                path: self.path(name),
                types,
            })
        }
    }

    fn set_time(&self, _options: AccessOptions, name: &EntryName, times: &Times) -> Result<(), FsError> {
        let file = File::open(self.local(name)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TreeError::NoSuchNode { name: name.clone() }.into(),
            _ => self.io(name, e),
        })?;
        set_file_times(&file, times).map_err(|e| self.io(name, e))
    }

    fn input(&self, _options: AccessOptions, name: &EntryName) -> Result<EntryReader, FsError> {
        match self.metadata(name)? {
            None => Err(FsError::NoSuchEntry {
                path: self.path(name),
            }),
            Some(metadata) if metadata.is_dir() => Err(FsError::IsDirectory {
                path: self.path(name),
            }),
            Some(_) => {
                let data = fs::read(self.local(name)).map_err(|e| self.io(name, e))?;
                trace!(path = %self.path(name), bytes = data.len(), "read local file");
                Ok(EntryReader::new(
                    self.path(name),
                    data.into(),
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
        let path = self.path(name);
        let existing = self.metadata(name)?;
        match &existing {
            Some(metadata) if metadata.is_dir() => return Err(FsError::IsDirectory { path }),
            Some(_) if options.contains(AccessOptions::EXCLUSIVE) => {
                return Err(TreeError::NodeExists { name: name.clone() }.into());
            }
            Some(_) => {}
            None => self.create_file(options, name, template)?,
        }

        let local = self.local(name);
        let mut buffer =
            PooledBuffer::allocate(self.model.pool()).map_err(|e| FsError::io(&path, e))?;
        if options.contains(AccessOptions::APPEND) && existing.is_some() {
            let data = fs::read(&local).map_err(|e| FsError::io(&path, e))?;
            buffer.append(&data).map_err(|e| FsError::io(&path, e))?;
        }
        let sink = LocalSink {
            target: local,
            path: path.clone(),
            mode: template.map(|t| t.mode),
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
        let existing = self.metadata(name)?;
        match (node_type, existing) {
            (_, Some(_)) if options.contains(AccessOptions::EXCLUSIVE) => {
                Err(TreeError::NodeExists { name: name.clone() }.into())
            }
            (NodeType::Directory, Some(metadata)) if metadata.is_dir() => Ok(()),
            (NodeType::File, Some(metadata)) if !metadata.is_dir() => {
                self.create_file(options, name, template)
            }
            (_, Some(_)) => Err(TreeError::NodeExists { name: name.clone() }.into()),
            (NodeType::File, None) => self.create_file(options, name, template),
            (NodeType::Directory, None) => {
                self.prepare_parent(options, name)?;
                fs::create_dir(self.local(name)).map_err(|e| self.io(name, e))
            }
        }
    }

    fn unlink(&self, _options: AccessOptions, name: &EntryName) -> Result<(), FsError> {
        if name.is_root() {
            return Err(TreeError::RootNode { operation: "unlink" }.into());
        }
        let metadata = self
            .metadata(name)?
            .ok_or_else(|| TreeError::NoSuchNode { name: name.clone() })?;
        let local = self.local(name);
        let result = if metadata.is_dir() {
            fs::remove_dir(&local)
        } else {
            fs::remove_file(&local)
        };
        result.map_err(|e| match e.kind() {
            io::ErrorKind::DirectoryNotEmpty => {
                TreeError::DirectoryNotEmpty { name: name.clone() }.into()
            }
            _ => self.io(name, e),
        })
    }

    fn sync(&self, options: SyncOptions) -> Result<(), SyncError> {
        let mut builder = SyncErrorBuilder::new();
        close_resources(&self.model, options, &mut builder);
        builder.check()
    }
}

/// Replaces the target file atomically on commit.
///
/// The replacement takes over the permissions of the file it replaces, or
/// the template mode if the target vanished in the meantime.
struct LocalSink {
    target: PathBuf,
    path: NodePath,
    mode: Option<u32>,
}

impl LocalSink {
    fn permissions(&self) -> io::Result<Option<Permissions>> {
        match fs::metadata(&self.target) {
            Ok(metadata) => Ok(Some(metadata.permissions())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(self.mode.and_then(permissions_of)),
            Err(e) => Err(e),
        }
    }
}

#[cfg(unix)]
fn permissions_of(mode: u32) -> Option<Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn permissions_of(_mode: u32) -> Option<Permissions> {
    None
}

impl OutputSink for LocalSink {
    fn commit(&self, mut buffer: PooledBuffer) -> Result<(), FsError> {
        let fail = |e: io::Error| FsError::io(&self.path, e);
        let data = buffer.read_all().map_err(fail)?;
        let directory = self.target.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(directory).map_err(fail)?;
        temp.write_all(&data).map_err(fail)?;
        if let Some(permissions) = self.permissions().map_err(fail)? {
            temp.as_file().set_permissions(permissions).map_err(fail)?;
        }
        temp.as_file().sync_all().map_err(fail)?;
        temp.persist(&self.target).map_err(|e| fail(e.error))?;
        trace!(path = %self.path, bytes = data.len(), "committed local file");
        Ok(())
    }
}
