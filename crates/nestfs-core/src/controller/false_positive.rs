use std::sync::Arc;

use tracing::debug;

use super::{
    AccessOptions, AccessTypes, ArchiveController, Controller, ControllerModel, FalsePositive,
    Routed, RoutedResult,
};
use crate::addr::EntryName;
use crate::archive::{Node, NodeType, Times};
use crate::error::FsError;
use crate::resource::{EntryReader, EntryWriter};
use crate::sync::{SyncError, SyncOptions};

/// Decorator resolving false positive archives.
///
/// When the archive controller reports that its mount point is not an
/// archive, the same operation is retried on the parent file system with the
/// archive file name as a plain path segment. If the retry fails too, the
/// original cause is returned.
#[derive(Debug)]
pub struct FalsePositiveController {
    inner: ArchiveController,
}

impl FalsePositiveController {
    pub fn new(inner: ArchiveController) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &ArchiveController {
        &self.inner
    }

    fn resolve<T, F>(&self, routed: RoutedResult<T>, name: &EntryName, retry: F) -> Result<T, FsError>
    where
        F: FnOnce(&Arc<dyn Controller>, &EntryName) -> Result<T, FsError>,
    {
        match routed? {
            Routed::Handled(value) => Ok(value),
            Routed::RouteToParent(FalsePositive { cause }) => {
                let parent = self.inner.parent_controller()?;
                let parent_name = self
                    .inner
                    .archive_path()?
                    .entry_name()
                    .join(name.as_str())?;
                debug!(
                    mount_point = %self.mount_point(),
                    %cause,
                    retry = %parent.mount_point().resolve(&parent_name),
                    "retrying false positive on parent file system"
                );
                retry(parent, &parent_name).map_err(|retry_error| {
                    debug!(error = %retry_error, "retry on parent file system failed");
                    cause
                })
            }
        }
    }
}

impl Controller for FalsePositiveController {
    fn model(&self) -> &ControllerModel {
        self.inner.model()
    }

    fn stat(&self, options: AccessOptions, name: &EntryName) -> Result<Option<Node>, FsError> {
        self.resolve(self.inner.stat(name), name, |parent, name| {
            parent.stat(options, name)
        })
    }

    fn check_access(
        &self,
        options: AccessOptions,
        name: &EntryName,
        types: AccessTypes,
    ) -> Result<(), FsError> {
        self.resolve(self.inner.check_access(name, types), name, |parent, name| {
            parent.check_access(options, name, types)
        })
    }

    fn set_time(&self, options: AccessOptions, name: &EntryName, times: &Times) -> Result<(), FsError> {
        self.resolve(self.inner.set_time(name, times), name, |parent, name| {
            parent.set_time(options, name, times)
        })
    }

    fn input(&self, options: AccessOptions, name: &EntryName) -> Result<EntryReader, FsError> {
        self.resolve(self.inner.input(name), name, |parent, name| {
            parent.input(options, name)
        })
    }

    fn output(
        &self,
        options: AccessOptions,
        name: &EntryName,
        template: Option<&Node>,
    ) -> Result<EntryWriter, FsError> {
        self.resolve(
            self.inner.output(options, name, template),
            name,
            |parent, name| parent.output(options, name, template),
        )
    }

    fn mknod(
        &self,
        options: AccessOptions,
        name: &EntryName,
        node_type: NodeType,
        template: Option<&Node>,
    ) -> Result<(), FsError> {
        self.resolve(
            self.inner.mknod(options, name, node_type, template),
            name,
            |parent, name| parent.mknod(options, name, node_type, template),
        )
    }

    fn unlink(&self, options: AccessOptions, name: &EntryName) -> Result<(), FsError> {
        self.resolve(self.inner.unlink(name), name, |parent, name| {
            parent.unlink(options, name)
        })
    }

    fn sync(&self, options: SyncOptions) -> Result<(), SyncError> {
        self.inner.sync(options)
    }

    fn is_idle(&self) -> bool {
        self.inner.is_idle()
    }
}
