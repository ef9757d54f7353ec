use tracing::instrument;

use super::{AccessOptions, AccessTypes, Controller, ControllerModel};
use crate::addr::EntryName;
use crate::archive::{Node, NodeType, Times};
use crate::error::FsError;
use crate::resource::{EntryReader, EntryWriter};
use crate::sync::{SyncError, SyncErrorBuilder, SyncIssueKind, SyncOptions};

/// Outermost decorator: serializes access to one mount point.
///
/// Read-only operations run under the read lock, mutating ones and sync
/// under the write lock. Guards are released on every exit path.
#[derive(Debug)]
pub struct LockController<C> {
    inner: C,
}

impl<C: Controller> LockController<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: Controller> Controller for LockController<C> {
    fn model(&self) -> &ControllerModel {
        self.inner.model()
    }

    #[instrument(level = "debug", skip(self, options, name), fields(mount_point = %self.mount_point(), name = %name))]
    fn stat(&self, options: AccessOptions, name: &EntryName) -> Result<Option<Node>, FsError> {
        let _guard = self.model().lock().read()?;
        self.inner.stat(options, name)
    }

    fn check_access(
        &self,
        options: AccessOptions,
        name: &EntryName,
        types: AccessTypes,
    ) -> Result<(), FsError> {
        let _guard = self.model().lock().read()?;
        self.inner.check_access(options, name, types)
    }

    fn set_time(&self, options: AccessOptions, name: &EntryName, times: &Times) -> Result<(), FsError> {
        let _guard = self.model().lock().write()?;
        self.inner.set_time(options, name, times)
    }

    #[instrument(level = "debug", skip(self, options, name), fields(mount_point = %self.mount_point(), name = %name))]
    fn input(&self, options: AccessOptions, name: &EntryName) -> Result<EntryReader, FsError> {
        let _guard = self.model().lock().read()?;
        self.inner.input(options, name)
    }

    #[instrument(level = "debug", skip(self, options, name, template), fields(mount_point = %self.mount_point(), name = %name))]
    fn output(
        &self,
        options: AccessOptions,
        name: &EntryName,
        template: Option<&Node>,
    ) -> Result<EntryWriter, FsError> {
        let _guard = self.model().lock().write()?;
        self.inner.output(options, name, template)
    }

    #[instrument(level = "debug", skip(self, options, name, template), fields(mount_point = %self.mount_point(), name = %name))]
    fn mknod(
        &self,
        options: AccessOptions,
        name: &EntryName,
        node_type: NodeType,
        template: Option<&Node>,
    ) -> Result<(), FsError> {
        let _guard = self.model().lock().write()?;
        self.inner.mknod(options, name, node_type, template)
    }

    #[instrument(level = "debug", skip(self, options, name), fields(mount_point = %self.mount_point(), name = %name))]
    fn unlink(&self, options: AccessOptions, name: &EntryName) -> Result<(), FsError> {
        let _guard = self.model().lock().write()?;
        self.inner.unlink(options, name)
    }

    #[instrument(level = "debug", skip(self), fields(mount_point = %self.mount_point()))]
    fn sync(&self, options: SyncOptions) -> Result<(), SyncError> {
        let _guard = match self.model().lock().write() {
            Ok(guard) => guard,
            Err(e) => {
                let mut builder = SyncErrorBuilder::new();
                builder.push(self.mount_point(), SyncIssueKind::Lock(e));
                return builder.check();
            }
        };
        self.inner.sync(options)
    }

    fn is_idle(&self) -> bool {
        self.inner.is_idle()
    }
}
