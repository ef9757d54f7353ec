//! Registry of controller chains, one per mount point.
//!
//! The [`Manager`] builds the chain of a mount point on first reference and
//! hands out the same instance until the chain is evicted by a sync. Evicted
//! chains that a client still holds are only weakly retained, so a later
//! lookup revives them instead of building a second chain for the same mount
//! point.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};

use crate::addr::{AddressError, MountPoint, Scheme};
use crate::archive::ArchiveDriver;
use crate::config::KernelConfig;
use crate::controller::{
    ArchiveController, CacheController, Controller, ControllerModel, FalsePositiveController,
    LockController,
};
use crate::error::FsError;
use crate::pool::{self, IoPool};
use crate::storage::{LocalDriver, MemoryDriver, MemoryStore, StorageDriver};
use crate::sync::{SyncError, SyncOptions, sync_controllers};

/// A driver selected by scheme.
#[derive(Debug, Clone)]
pub enum Driver {
    /// Serves hierarchical roots such as `file:/` or `mem:/`.
    Storage(Arc<dyn StorageDriver>),
    /// Serves archives nested in a parent file system.
    Archive(Arc<dyn ArchiveDriver>),
}

/// Drivers by scheme.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<Scheme, Driver>,
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry serving `mem:` from `store` and `file:` from the local
    /// file system.
    pub fn with_defaults(store: Arc<MemoryStore>) -> Self {
        let mut drivers = HashMap::new();
        drivers.insert(
            Scheme::from_static("mem"),
            Driver::Storage(Arc::new(MemoryDriver::new(store))),
        );
        drivers.insert(
            Scheme::from_static("file"),
            Driver::Storage(Arc::new(LocalDriver)),
        );
        Self { drivers }
    }

    pub fn with_storage(
        mut self,
        scheme: &str,
        driver: impl StorageDriver + 'static,
    ) -> Result<Self, AddressError> {
        self.drivers
            .insert(Scheme::new(scheme)?, Driver::Storage(Arc::new(driver)));
        Ok(self)
    }

    pub fn with_archive(
        mut self,
        scheme: &str,
        driver: impl ArchiveDriver + 'static,
    ) -> Result<Self, AddressError> {
        self.drivers
            .insert(Scheme::new(scheme)?, Driver::Archive(Arc::new(driver)));
        Ok(self)
    }

    pub fn get(&self, scheme: &Scheme) -> Option<&Driver> {
        self.drivers.get(scheme)
    }

    /// Schemes served by archive drivers.
    pub fn archive_schemes(&self) -> impl Iterator<Item = &Scheme> {
        self.drivers
            .iter()
            .filter(|(_, driver)| matches!(driver, Driver::Archive(_)))
            .map(|(scheme, _)| scheme)
    }
}

/// Registry entry of one mount point.
struct Slot {
    /// Set while the chain is registered, cleared on eviction.
    pinned: Option<Arc<dyn Controller>>,
    weak: Weak<dyn Controller>,
}

impl Slot {
    fn new(controller: &Arc<dyn Controller>) -> Self {
        Self {
            pinned: Some(Arc::clone(controller)),
            weak: Arc::downgrade(controller),
        }
    }

    /// Returns the chain, pinning it again if it was evicted but is alive.
    fn revive(&mut self) -> Option<Arc<dyn Controller>> {
        if let Some(controller) = &self.pinned {
            return Some(Arc::clone(controller));
        }
        let controller = self.weak.upgrade()?;
        self.pinned = Some(Arc::clone(&controller));
        Some(controller)
    }

    fn peek(&self) -> Option<Arc<dyn Controller>> {
        self.pinned.clone().or_else(|| self.weak.upgrade())
    }

    fn is_live(&self) -> bool {
        self.pinned.is_some() || self.weak.strong_count() > 0
    }
}

/// The registry of controller chains of one federation.
///
/// There is no process-wide instance; whoever needs one creates it and
/// passes it around, typically as `Arc<Manager>`.
pub struct Manager {
    drivers: DriverRegistry,
    config: Arc<KernelConfig>,
    pool: Arc<dyn IoPool>,
    controllers: DashMap<MountPoint, Slot>,
}

impl Manager {
    /// Creates a manager with the I/O pool described by `config`.
    pub fn new(drivers: DriverRegistry, config: KernelConfig) -> Self {
        let pool = pool::from_config(&config.pool);
        Self::with_pool(drivers, config, pool)
    }

    pub fn with_pool(drivers: DriverRegistry, config: KernelConfig, pool: Arc<dyn IoPool>) -> Self {
        Self {
            drivers,
            config: Arc::new(config),
            pool,
            controllers: DashMap::new(),
        }
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<dyn IoPool> {
        &self.pool
    }

    /// Returns the chain of `mount_point`, building it and the chains of all
    /// enclosing file systems if needed.
    ///
    /// Concurrent first lookups of the same mount point all receive the same
    /// instance.
    ///
    /// Hierarchical roots are registered per directory, so `mem:/` and
    /// `mem:/a/` are distinct chains with distinct locks over overlapping
    /// storage. Mount point locks do not exclude each other across such
    /// chains; root storage drivers synchronize their own state. The parent of
    /// an archive is always the root of the directory holding the archive
    /// file, so every archive is serialized by exactly one lock.
    pub fn controller(&self, mount_point: &MountPoint) -> Result<Arc<dyn Controller>, FsError> {
        if let Some(mut slot) = self.controllers.get_mut(mount_point) {
            if let Some(controller) = slot.revive() {
                return Ok(controller);
            }
        }

        // Parents are resolved before the entry is locked, so no two shard
        // locks are ever held at once.
        let parent = match mount_point.parent() {
            Some(parent) => Some(self.controller(parent)?),
            None => None,
        };

        match self.controllers.entry(mount_point.clone()) {
            Entry::Occupied(mut occupied) => {
                if let Some(controller) = occupied.get_mut().revive() {
                    return Ok(controller);
                }
                let controller = self.build(mount_point, parent)?;
                occupied.insert(Slot::new(&controller));
                Ok(controller)
            }
            Entry::Vacant(vacant) => {
                let controller = self.build(mount_point, parent)?;
                vacant.insert(Slot::new(&controller));
                Ok(controller)
            }
        }
    }

    fn build(
        &self,
        mount_point: &MountPoint,
        parent: Option<Arc<dyn Controller>>,
    ) -> Result<Arc<dyn Controller>, FsError> {
        let driver = self
            .drivers
            .get(mount_point.scheme())
            .ok_or_else(|| FsError::UnknownScheme {
                scheme: mount_point.scheme().clone(),
            })?;
        let unsupported = |reason: &str| FsError::UnsupportedMountPoint {
            mount_point: mount_point.clone(),
            reason: reason.to_string(),
        };
        let is_archive = parent.is_some();
        let model = ControllerModel::new(
            mount_point.clone(),
            parent,
            Arc::clone(&self.pool),
            Arc::clone(&self.config),
        );

        let controller: Arc<dyn Controller> = match driver {
            Driver::Storage(_) if is_archive => {
                return Err(unsupported("storage drivers only serve hierarchical roots"));
            }
            Driver::Archive(_) if !is_archive => {
                return Err(unsupported("archive drivers need a parent file system"));
            }
            Driver::Storage(driver) => {
                Arc::new(LockController::new(driver.new_controller(model)?))
            }
            Driver::Archive(driver) => {
                let archive =
                    FalsePositiveController::new(ArchiveController::new(model, Arc::clone(driver)));
                if self.config.cache.enabled {
                    Arc::new(LockController::new(CacheController::new(
                        archive,
                        &self.config.cache,
                    )))
                } else {
                    Arc::new(LockController::new(archive))
                }
            }
        };
        info!(%mount_point, "registered controller");
        Ok(controller)
    }

    /// The live chains of `filter` and every mount point within it, or of all
    /// mount points without a filter.
    pub fn enumerate(&self, filter: Option<&MountPoint>) -> ControllerSet<'_> {
        ControllerSet {
            manager: self,
            filter: filter.cloned(),
        }
    }

    /// Syncs the chains selected by `filter`, children before parents.
    ///
    /// Every selected chain is synced even if others fail; chains that synced
    /// without error and are idle afterwards are evicted.
    pub fn sync(&self, options: SyncOptions, filter: Option<&MountPoint>) -> Result<(), SyncError> {
        let controllers: Vec<_> = self.enumerate(filter).iter().collect();
        let result = sync_controllers(controllers, options, |controller| {
            if controller.is_idle() {
                self.evict(controller.mount_point());
            }
        });
        self.controllers.retain(|_, slot| slot.is_live());
        result
    }

    pub fn sync_all(&self, options: SyncOptions) -> Result<(), SyncError> {
        self.sync(options, None)
    }

    /// Number of registered (not evicted) chains.
    pub fn len(&self) -> usize {
        self.controllers
            .iter()
            .filter(|slot| slot.pinned.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_registered(&self, mount_point: &MountPoint) -> bool {
        self.controllers
            .get(mount_point)
            .is_some_and(|slot| slot.pinned.is_some())
    }

    fn evict(&self, mount_point: &MountPoint) {
        if let Some(mut slot) = self.controllers.get_mut(mount_point) {
            if slot.pinned.take().is_some() {
                debug!(%mount_point, "evicted controller");
            }
        }
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("drivers", &self.drivers)
            .field("controllers", &self.len())
            .finish_non_exhaustive()
    }
}

/// A restartable view of the live chains of a [`Manager`].
///
/// Each call to [`iter`](Self::iter) walks the registry afresh.
#[derive(Debug, Clone)]
pub struct ControllerSet<'a> {
    manager: &'a Manager,
    filter: Option<MountPoint>,
}

impl ControllerSet<'_> {
    /// Walks the registry lazily.
    ///
    /// The iterator holds registry shard locks while it is alive; callers
    /// that look up or sync controllers should collect it first.
    pub fn iter(&self) -> impl Iterator<Item = Arc<dyn Controller>> + '_ {
        self.manager.controllers.iter().filter_map(move |slot| {
            let selected = self
                .filter
                .as_ref()
                .is_none_or(|filter| slot.key().is_within(filter));
            if selected { slot.peek() } else { None }
        })
    }

    pub fn mount_points(&self) -> Vec<MountPoint> {
        let mut mount_points: Vec<_> = self
            .iter()
            .map(|controller| controller.mount_point().clone())
            .collect();
        mount_points.sort();
        mount_points
    }
}
