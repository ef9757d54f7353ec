//! The controller chain.
//!
//! Every mount point is served by exactly one chain of controllers, all
//! implementing the same capability surface ([`Controller`]). For archives
//! the chain is, outermost first:
//!
//! 1. [`LockController`]: takes the mount point's read or write lock
//! 2. [`CacheController`]: keeps decoded entry contents (optional)
//! 3. [`FalsePositiveController`]: reroutes operations to the parent file
//!    system when the mount point turns out not to be an archive
//! 4. [`ArchiveController`]: owns the archive's virtual file system
//!
//! Root file systems use a [`LockController`] over their storage controller.
//! Chains are assembled once per mount point by the
//! [`Manager`](crate::manager::Manager).

mod archive;
mod cache;
mod false_positive;
mod lock;
mod model;

pub use archive::ArchiveController;
pub use cache::{CacheController, CacheStats};
pub use false_positive::FalsePositiveController;
pub use lock::LockController;
pub use model::ControllerModel;

use std::fmt::Debug;
use std::sync::Arc;

use bitflags::bitflags;

use crate::addr::{EntryName, MountPoint};
use crate::archive::{Node, NodeType, Times};
use crate::error::FsError;
use crate::resource::{EntryReader, EntryWriter, ResourceCounts, ResourceKind};
use crate::sync::{SyncError, SyncErrorBuilder, SyncIssueKind, SyncOptions};

bitflags! {
    /// Options of controller operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessOptions: u32 {
        /// Create missing parent directories
        const CREATE_PARENTS = 1 << 0;
        /// Fail if the node already exists
        const EXCLUSIVE = 1 << 1;
        /// Start output from the existing content
        const APPEND = 1 << 2;
        /// Allow the caching controller to keep the entry
        ///
        /// Cached entries are served without consulting the archive again.
        /// Changes made to the archive file outside the kernel stay invisible
        /// until a sync with `CLEAR_CACHE` or `ABORT_CHANGES`.
        const CACHE = 1 << 3;
    }
}

bitflags! {
    /// Access checks of [`Controller::check_access`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessTypes: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl AccessTypes {
    /// Whether unix permission bits `mode` grant these access types to
    /// anybody.
    pub fn granted_by(self, mode: u32) -> bool {
        (!self.contains(AccessTypes::READ) || mode & 0o444 != 0)
            && (!self.contains(AccessTypes::WRITE) || mode & 0o222 != 0)
            && (!self.contains(AccessTypes::EXECUTE) || mode & 0o111 != 0)
    }
}

/// The capability surface of one mount point.
pub trait Controller: Send + Sync + Debug {
    fn model(&self) -> &ControllerModel;

    fn mount_point(&self) -> &MountPoint {
        self.model().mount_point()
    }

    /// Controller of the enclosing file system, `None` for roots.
    fn parent(&self) -> Option<&Arc<dyn Controller>> {
        self.model().parent()
    }

    /// Metadata of a node, `None` if absent.
    fn stat(&self, options: AccessOptions, name: &EntryName) -> Result<Option<Node>, FsError>;

    /// Fails with [`FsError::AccessDenied`] if any requested type is denied.
    fn check_access(
        &self,
        options: AccessOptions,
        name: &EntryName,
        types: AccessTypes,
    ) -> Result<(), FsError>;

    /// Replaces the provided timestamp components.
    fn set_time(&self, options: AccessOptions, name: &EntryName, times: &Times) -> Result<(), FsError>;

    /// Opens a file for reading.
    fn input(&self, options: AccessOptions, name: &EntryName) -> Result<EntryReader, FsError>;

    /// Opens a file for writing, creating it if needed.
    fn output(
        &self,
        options: AccessOptions,
        name: &EntryName,
        template: Option<&Node>,
    ) -> Result<EntryWriter, FsError>;

    fn mknod(
        &self,
        options: AccessOptions,
        name: &EntryName,
        node_type: NodeType,
        template: Option<&Node>,
    ) -> Result<(), FsError>;

    fn unlink(&self, options: AccessOptions, name: &EntryName) -> Result<(), FsError>;

    /// Commits or discards pending changes and releases resources.
    fn sync(&self, options: SyncOptions) -> Result<(), SyncError>;

    /// Whether the controller holds neither open resources nor uncommitted
    /// changes, so it may be evicted.
    fn is_idle(&self) -> bool {
        self.model().resources().counts().total() == 0
    }
}

impl<C: Controller + ?Sized> Controller for Box<C> {
    fn model(&self) -> &ControllerModel {
        (**self).model()
    }

    fn stat(&self, options: AccessOptions, name: &EntryName) -> Result<Option<Node>, FsError> {
        (**self).stat(options, name)
    }

    fn check_access(
        &self,
        options: AccessOptions,
        name: &EntryName,
        types: AccessTypes,
    ) -> Result<(), FsError> {
        (**self).check_access(options, name, types)
    }

    fn set_time(&self, options: AccessOptions, name: &EntryName, times: &Times) -> Result<(), FsError> {
        (**self).set_time(options, name, times)
    }

    fn input(&self, options: AccessOptions, name: &EntryName) -> Result<EntryReader, FsError> {
        (**self).input(options, name)
    }

    fn output(
        &self,
        options: AccessOptions,
        name: &EntryName,
        template: Option<&Node>,
    ) -> Result<EntryWriter, FsError> {
        (**self).output(options, name, template)
    }

    fn mknod(
        &self,
        options: AccessOptions,
        name: &EntryName,
        node_type: NodeType,
        template: Option<&Node>,
    ) -> Result<(), FsError> {
        (**self).mknod(options, name, node_type, template)
    }

    fn unlink(&self, options: AccessOptions, name: &EntryName) -> Result<(), FsError> {
        (**self).unlink(options, name)
    }

    fn sync(&self, options: SyncOptions) -> Result<(), SyncError> {
        (**self).sync(options)
    }

    fn is_idle(&self) -> bool {
        (**self).is_idle()
    }
}

/// Signal that a mount point is not an archive after all.
#[derive(Debug)]
pub(crate) struct FalsePositive {
    pub(crate) cause: FsError,
}

/// Outcome of an archive operation: handled here, or to be retried on the
/// parent file system with the archive treated as a plain file.
///
/// Only [`FalsePositiveController`] consumes this, one frame up from where it
/// is produced.
#[must_use]
#[derive(Debug)]
pub(crate) enum Routed<T> {
    Handled(T),
    RouteToParent(FalsePositive),
}

pub(crate) type RoutedResult<T> = Result<Routed<T>, FsError>;

/// Waits for, refuses or forcibly closes the open resources of a mount point
/// before a sync, according to `options`.
///
/// Returns whether the sync may proceed to commit.
pub(crate) fn close_resources(
    model: &ControllerModel,
    options: SyncOptions,
    builder: &mut SyncErrorBuilder,
) -> bool {
    let resources = model.resources();
    let mount_point = model.mount_point();
    let wait_inputs = options.contains(SyncOptions::WAIT_CLOSE_INPUT);
    let wait_outputs = options.contains(SyncOptions::WAIT_CLOSE_OUTPUT);
    if (wait_inputs || wait_outputs) && resources.counts_of_other_threads().total() > 0 {
        if let Err(e) = resources.wait_for_other_threads(
            wait_inputs,
            wait_outputs,
            model.config().sync_wait_timeout,
        ) {
            builder.push(mount_point, SyncIssueKind::Lock(e));
            return false;
        }
    }

    let counts = resources.counts();
    let force_inputs = options.contains(SyncOptions::FORCE_CLOSE_INPUT);
    let force_outputs = options.contains(SyncOptions::FORCE_CLOSE_OUTPUT);
    if (counts.inputs > 0 && !force_inputs) || (counts.outputs > 0 && !force_outputs) {
        builder.push(
            mount_point,
            SyncIssueKind::OpenResources {
                inputs: counts.inputs,
                outputs: counts.outputs,
            },
        );
        return false;
    }

    let mut forced = ResourceCounts::default();
    for kind in [ResourceKind::Input, ResourceKind::Output] {
        if counts.get(kind) == 0 {
            continue;
        }
        let (closed, errors) = resources.close_all(kind);
        match kind {
            ResourceKind::Input => forced.inputs = closed,
            ResourceKind::Output => forced.outputs = closed,
        }
        for error in errors {
            builder.push(mount_point, SyncIssueKind::Close(error));
        }
    }
    if forced.total() > 0 {
        builder.push(
            mount_point,
            SyncIssueKind::ForcedClose {
                inputs: forced.inputs,
                outputs: forced.outputs,
            },
        );
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_types_granted_by_mode() {
        assert!(AccessTypes::READ.granted_by(0o400));
        assert!((AccessTypes::READ | AccessTypes::WRITE).granted_by(0o644));
        assert!(!AccessTypes::EXECUTE.granted_by(0o644));
        assert!(!AccessTypes::WRITE.granted_by(0o444));
        assert!(AccessTypes::empty().granted_by(0));
    }
}
