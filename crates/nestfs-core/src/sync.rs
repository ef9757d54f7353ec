//! The sync engine: committing archives and aggregating failures.
//!
//! Syncing a set of controllers visits children before their parents, since
//! committing a nested archive writes new bytes through its parent. A failure
//! of one controller never stops the batch; every issue is collected into one
//! [`SyncError`], which is only a warning when no issue risks data loss.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::addr::MountPoint;
use crate::controller::Controller;
use crate::error::FsError;
use crate::lock::LockError;

bitflags! {
    /// Options of a sync operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SyncOptions: u32 {
        /// Wait for other threads to close their input resources
        const WAIT_CLOSE_INPUT = 1 << 0;
        /// Wait for other threads to close their output resources
        const WAIT_CLOSE_OUTPUT = 1 << 1;
        /// Forcibly close input resources still open
        const FORCE_CLOSE_INPUT = 1 << 2;
        /// Forcibly close output resources still open
        const FORCE_CLOSE_OUTPUT = 1 << 3;
        /// Discard uncommitted changes instead of committing them
        const ABORT_CHANGES = 1 << 4;
        /// Drop cached entry contents
        const CLEAR_CACHE = 1 << 5;

        /// Commit changes, waiting for open resources and keeping caches.
        const SYNC = Self::WAIT_CLOSE_INPUT.bits() | Self::WAIT_CLOSE_OUTPUT.bits();
        /// Commit changes, forcibly closing open resources and clearing caches.
        const UMOUNT = Self::FORCE_CLOSE_INPUT.bits()
            | Self::FORCE_CLOSE_OUTPUT.bits()
            | Self::CLEAR_CACHE.bits();
        /// Discard changes, forcibly closing open resources and clearing caches.
        const RESET = Self::ABORT_CHANGES.bits()
            | Self::FORCE_CLOSE_INPUT.bits()
            | Self::FORCE_CLOSE_OUTPUT.bits()
            | Self::CLEAR_CACHE.bits();
    }
}

/// Whether an issue risks data loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// The sync completed but had to apply a constraint, e.g. a forced close.
    Warning,
    /// Changes may not have been committed.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => f.write_str("warning"),
            Severity::Error => f.write_str("error"),
        }
    }
}

/// What went wrong while syncing one mount point.
#[derive(Debug, Error)]
pub enum SyncIssueKind {
    #[error("forcibly closed {inputs} input and {outputs} output resource(s)")]
    ForcedClose { inputs: usize, outputs: usize },

    #[error("{inputs} input and {outputs} output resource(s) are still open")]
    OpenResources { inputs: usize, outputs: usize },

    #[error("commit failed: {0}")]
    Commit(#[source] FsError),

    #[error("closing a resource failed: {0}")]
    Close(#[source] FsError),

    #[error("could not lock: {0}")]
    Lock(#[source] LockError),
}

impl SyncIssueKind {
    pub fn severity(&self) -> Severity {
        match self {
            SyncIssueKind::ForcedClose { .. } => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

/// One failure of a sync, attributed to a mount point.
#[derive(Debug, Error)]
#[error("{severity} syncing {mount_point}: {kind}")]
pub struct SyncIssue {
    pub mount_point: MountPoint,
    pub severity: Severity,
    #[source]
    pub kind: SyncIssueKind,
}

impl SyncIssue {
    pub fn new(mount_point: MountPoint, kind: SyncIssueKind) -> Self {
        Self {
            mount_point,
            severity: kind.severity(),
            kind,
        }
    }
}

/// All issues of one sync invocation.
#[derive(Debug)]
pub struct SyncError {
    issues: Vec<SyncIssue>,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync reported {} issue(s)", self.issues.len())?;
        if let Some(first) = self.issues.first() {
            write!(f, ", first: {first}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.issues.first().map(|i| i as &(dyn std::error::Error + 'static))
    }
}

impl SyncError {
    pub fn issues(&self) -> &[SyncIssue] {
        &self.issues
    }

    pub fn into_issues(self) -> Vec<SyncIssue> {
        self.issues
    }

    /// Whether every issue is a warning.
    pub fn is_warning(&self) -> bool {
        self.issues.iter().all(|i| i.severity == Severity::Warning)
    }

    pub fn severity(&self) -> Severity {
        self.issues
            .iter()
            .map(|i| i.severity)
            .max()
            .unwrap_or(Severity::Warning)
    }

    /// Mount points with at least one issue of the given severity.
    pub fn mount_points(&self, severity: Severity) -> Vec<&MountPoint> {
        let mut out: Vec<&MountPoint> = self
            .issues
            .iter()
            .filter(|i| i.severity == severity)
            .map(|i| &i.mount_point)
            .collect();
        out.dedup();
        out
    }
}

/// Accumulates sync issues across a batch.
#[derive(Debug, Default)]
pub struct SyncErrorBuilder {
    issues: Vec<SyncIssue>,
}

impl SyncErrorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mount_point: &MountPoint, kind: SyncIssueKind) {
        let issue = SyncIssue::new(mount_point.clone(), kind);
        match issue.severity {
            Severity::Warning => warn!(mount_point = %issue.mount_point, "{}", issue.kind),
            Severity::Error => warn!(mount_point = %issue.mount_point, error = %issue.kind, "sync failed"),
        }
        self.issues.push(issue);
    }

    pub fn extend(&mut self, error: SyncError) {
        self.issues.extend(error.issues);
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    /// `Ok` if nothing was collected, else the aggregate error.
    pub fn check(self) -> Result<(), SyncError> {
        if self.issues.is_empty() {
            Ok(())
        } else {
            Err(SyncError {
                issues: self.issues,
            })
        }
    }
}

/// Syncs `controllers` children first and aggregates all issues.
///
/// `on_synced` is called for every controller whose sync reported no error
/// (warnings allowed), so the caller can evict it.
pub(crate) fn sync_controllers<F>(
    mut controllers: Vec<Arc<dyn Controller>>,
    options: SyncOptions,
    mut on_synced: F,
) -> Result<(), SyncError>
where
    F: FnMut(&Arc<dyn Controller>),
{
    controllers.sort_by(|a, b| {
        let (a, b) = (a.mount_point(), b.mount_point());
        b.depth().cmp(&a.depth()).then_with(|| a.cmp(b))
    });
    info!(count = controllers.len(), ?options, "syncing controllers");

    let mut builder = SyncErrorBuilder::new();
    for controller in &controllers {
        debug!(mount_point = %controller.mount_point(), "syncing");
        match controller.sync(options) {
            Ok(()) => on_synced(controller),
            Err(error) => {
                if error.is_warning() {
                    on_synced(controller);
                }
                builder.extend(error);
            }
        }
    }
    builder.check()
}
