use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use moka::sync::Cache;
use tracing::{debug, trace};

use super::{AccessOptions, AccessTypes, Controller, ControllerModel};
use crate::addr::EntryName;
use crate::archive::{Node, NodeType, Times};
use crate::config::CacheConfig;
use crate::error::FsError;
use crate::resource::{EntryReader, EntryWriter};
use crate::sync::{SyncError, SyncOptions};

/// Counters of one entry cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub entries: u64,
}

impl CacheStats {
    /// Fraction of lookups served from the cache, 0.0 to 1.0
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

/// Decorator keeping decoded entry contents of one mount point.
///
/// Entries are cached on [`AccessOptions::CACHE`] reads, bounded by total
/// bytes, and invalidated by any write, creation or removal of the same
/// entry. Cached contents are shared read-only between readers.
#[derive(Debug)]
pub struct CacheController<C> {
    inner: C,
    entries: Cache<EntryName, Arc<[u8]>>,
    counters: Arc<Counters>,
}

impl<C: Controller> CacheController<C> {
    pub fn new(inner: C, config: &CacheConfig) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.max_bytes)
            .weigher(|_name: &EntryName, data: &Arc<[u8]>| u32::try_from(data.len()).unwrap_or(u32::MAX))
            .time_to_idle(config.time_to_idle)
            .build();
        Self {
            inner,
            entries,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.entries.run_pending_tasks();
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            entries: self.entries.entry_count(),
        }
    }

    fn invalidate(&self, name: &EntryName) {
        invalidate(&self.entries, &self.counters, name);
    }

    fn invalidate_all(&self) {
        self.entries.invalidate_all();
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!(mount_point = %self.mount_point(), "cleared entry cache");
    }
}

fn invalidate(entries: &Cache<EntryName, Arc<[u8]>>, counters: &Counters, name: &EntryName) {
    if entries.remove(name).is_some() {
        counters.invalidations.fetch_add(1, Ordering::Relaxed);
        trace!(%name, "invalidated cached entry");
    }
}

impl<C: Controller> Controller for CacheController<C> {
    fn model(&self) -> &ControllerModel {
        self.inner.model()
    }

    fn stat(&self, options: AccessOptions, name: &EntryName) -> Result<Option<Node>, FsError> {
        self.inner.stat(options, name)
    }

    fn check_access(
        &self,
        options: AccessOptions,
        name: &EntryName,
        types: AccessTypes,
    ) -> Result<(), FsError> {
        self.inner.check_access(options, name, types)
    }

    fn set_time(&self, options: AccessOptions, name: &EntryName, times: &Times) -> Result<(), FsError> {
        self.inner.set_time(options, name, times)
    }

    fn input(&self, options: AccessOptions, name: &EntryName) -> Result<EntryReader, FsError> {
        let path = self.mount_point().resolve(name);
        if let Some(data) = self.entries.get(name) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            trace!(%path, "entry cache hit");
            return Ok(EntryReader::new(path, data, Some(self.model().resources())));
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let reader = self.inner.input(options, name)?;
        if !options.contains(AccessOptions::CACHE) {
            return Ok(reader);
        }
        let data = reader.into_shared()?;
        self.entries.insert(name.clone(), Arc::clone(&data));
        Ok(EntryReader::new(path, data, Some(self.model().resources())))
    }

    fn output(
        &self,
        options: AccessOptions,
        name: &EntryName,
        template: Option<&Node>,
    ) -> Result<EntryWriter, FsError> {
        self.invalidate(name);
        let mut writer = self.inner.output(options, name, template)?;
        let entries = self.entries.clone();
        let counters = Arc::clone(&self.counters);
        let name = name.clone();
        writer.on_commit(move || invalidate(&entries, &counters, &name));
        Ok(writer)
    }

    fn mknod(
        &self,
        options: AccessOptions,
        name: &EntryName,
        node_type: NodeType,
        template: Option<&Node>,
    ) -> Result<(), FsError> {
        let result = self.inner.mknod(options, name, node_type, template);
        self.invalidate(name);
        result
    }

    fn unlink(&self, options: AccessOptions, name: &EntryName) -> Result<(), FsError> {
        let result = self.inner.unlink(options, name);
        if name.is_root() {
            self.invalidate_all();
        } else {
            self.invalidate(name);
        }
        result
    }

    fn sync(&self, options: SyncOptions) -> Result<(), SyncError> {
        let result = self.inner.sync(options);
        if options.intersects(SyncOptions::CLEAR_CACHE | SyncOptions::ABORT_CHANGES) {
            self.invalidate_all();
        }
        result
    }

    fn is_idle(&self) -> bool {
        self.inner.is_idle()
    }
}
