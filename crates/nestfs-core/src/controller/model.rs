use std::fmt;
use std::sync::Arc;

use crate::addr::MountPoint;
use crate::config::KernelConfig;
use crate::lock::ReentrantRwLock;
use crate::pool::IoPool;
use crate::resource::ResourceAccountant;

use super::Controller;

/// State shared by all controllers in the chain of one mount point.
///
/// The model is owned by the innermost controller; decorators reach it
/// through [`Controller::model`].
pub struct ControllerModel {
    mount_point: MountPoint,
    parent: Option<Arc<dyn Controller>>,
    lock: Arc<ReentrantRwLock>,
    resources: Arc<ResourceAccountant>,
    pool: Arc<dyn IoPool>,
    config: Arc<KernelConfig>,
}

impl ControllerModel {
    pub fn new(
        mount_point: MountPoint,
        parent: Option<Arc<dyn Controller>>,
        pool: Arc<dyn IoPool>,
        config: Arc<KernelConfig>,
    ) -> Self {
        let lock = Arc::new(ReentrantRwLock::new(
            mount_point.to_string(),
            config.lock_timeout,
        ));
        let resources = Arc::new(ResourceAccountant::new(Arc::clone(&lock)));
        Self {
            mount_point,
            parent,
            lock,
            resources,
            pool,
            config,
        }
    }

    pub fn mount_point(&self) -> &MountPoint {
        &self.mount_point
    }

    /// Controller of the file system containing this mount point.
    pub fn parent(&self) -> Option<&Arc<dyn Controller>> {
        self.parent.as_ref()
    }

    pub fn lock(&self) -> &Arc<ReentrantRwLock> {
        &self.lock
    }

    pub fn resources(&self) -> &Arc<ResourceAccountant> {
        &self.resources
    }

    pub fn pool(&self) -> &Arc<dyn IoPool> {
        &self.pool
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }
}

impl fmt::Debug for ControllerModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerModel")
            .field("mount_point", &self.mount_point)
            .field("resources", &self.resources.counts())
            .finish_non_exhaustive()
    }
}
