//! Temporary storage for archive entries being written.
//!
//! Writers buffer new entry contents in a [`PooledBuffer`] until the archive
//! is committed. Buffers come from an [`IoPool`] supplied by the environment
//! and go back to it when dropped, on every exit path.
//!
//! Two pools are provided: [`MemoryPool`] keeps buffers on the heap and
//! [`TempFilePool`] spills them to anonymous temporary files.

use std::fmt::Debug;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::config::{PoolConfig, PoolKind};

/// Storage behind a pooled buffer.
pub trait IoBuffer: Send + Debug {
    fn append(&mut self, data: &[u8]) -> io::Result<()>;

    fn read_all(&mut self) -> io::Result<Vec<u8>>;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self) -> io::Result<()>;

    /// Returns reusable heap storage, if this buffer has any.
    fn into_storage(self: Box<Self>) -> Option<Vec<u8>> {
        None
    }
}

/// A source of temporary buffers.
pub trait IoPool: Send + Sync + Debug {
    fn create_buffer(&self) -> io::Result<Box<dyn IoBuffer>>;

    fn release_buffer(&self, buffer: Box<dyn IoBuffer>);

    fn stats(&self) -> PoolStats;
}

/// Point-in-time buffer accounting of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated: u64,
    pub released: u64,
}

impl PoolStats {
    /// Buffers allocated but not yet released.
    pub fn live(&self) -> u64 {
        self.allocated.saturating_sub(self.released)
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    allocated: AtomicU64,
    released: AtomicU64,
}

impl PoolCounters {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

/// A buffer that returns to its pool when dropped.
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Option<Box<dyn IoBuffer>>,
    pool: Arc<dyn IoPool>,
}

impl PooledBuffer {
    pub fn allocate(pool: &Arc<dyn IoPool>) -> io::Result<Self> {
        let buffer = pool.create_buffer()?;
        Ok(Self {
            buffer: Some(buffer),
            pool: Arc::clone(pool),
        })
    }

    pub fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner()?.append(data)
    }

    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        self.inner()?.read_all()
    }

    pub fn clear(&mut self) -> io::Result<()> {
        self.inner()?.clear()
    }

    pub fn len(&self) -> u64 {
        self.buffer.as_ref().map_or(0, |b| b.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn inner(&mut self) -> io::Result<&mut Box<dyn IoBuffer>> {
        self.buffer
            .as_mut()
            .ok_or_else(|| io::Error::other("pooled buffer already released"))
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release_buffer(buffer);
        }
    }
}

#[derive(Debug, Default)]
struct MemoryBuffer(Vec<u8>);

impl IoBuffer for MemoryBuffer {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.0.extend_from_slice(data);
        Ok(())
    }

    fn read_all(&mut self) -> io::Result<Vec<u8>> {
        Ok(self.0.clone())
    }

    fn len(&self) -> u64 {
        self.0.len() as u64
    }

    fn clear(&mut self) -> io::Result<()> {
        self.0.clear();
        Ok(())
    }

    fn into_storage(self: Box<Self>) -> Option<Vec<u8>> {
        Some(self.0)
    }
}

/// Heap-backed pool that keeps a bounded number of released vectors for reuse.
#[derive(Debug)]
pub struct MemoryPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_free: usize,
    counters: PoolCounters,
}

impl MemoryPool {
    /// Default number of released vectors kept for reuse
    pub const DEFAULT_MAX_FREE: usize = 16;

    pub fn new() -> Self {
        Self::with_max_free(Self::DEFAULT_MAX_FREE)
    }

    pub fn with_max_free(max_free: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_free,
            counters: PoolCounters::default(),
        }
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl IoPool for MemoryPool {
    fn create_buffer(&self) -> io::Result<Box<dyn IoBuffer>> {
        let storage = self.free.lock().pop().unwrap_or_default();
        self.counters.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryBuffer(storage)))
    }

    fn release_buffer(&self, buffer: Box<dyn IoBuffer>) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        if let Some(mut storage) = buffer.into_storage() {
            storage.clear();
            let mut free = self.free.lock();
            if free.len() < self.max_free {
                free.push(storage);
            }
        }
    }

    fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }
}

#[derive(Debug)]
struct TempFileBuffer {
    file: File,
    len: u64,
}

impl IoBuffer for TempFileBuffer {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(data)?;
        self.len += data.len() as u64;
        Ok(())
    }

    fn read_all(&mut self) -> io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut out = Vec::with_capacity(usize::try_from(self.len).unwrap_or(0));
        self.file.read_to_end(&mut out)?;
        Ok(out)
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn clear(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.len = 0;
        Ok(())
    }
}

/// Pool of anonymous temporary files, deleted by the OS when released.
#[derive(Debug, Default)]
pub struct TempFilePool {
    directory: Option<PathBuf>,
    counters: PoolCounters,
}

impl TempFilePool {
    /// Creates a pool in the system temporary directory, or in `directory`.
    pub fn new(directory: Option<PathBuf>) -> Self {
        Self {
            directory,
            counters: PoolCounters::default(),
        }
    }
}

impl IoPool for TempFilePool {
    fn create_buffer(&self) -> io::Result<Box<dyn IoBuffer>> {
        let file = match &self.directory {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        self.counters.allocated.fetch_add(1, Ordering::Relaxed);
        trace!("allocated temp file buffer");
        Ok(Box::new(TempFileBuffer { file, len: 0 }))
    }

    fn release_buffer(&self, buffer: Box<dyn IoBuffer>) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        drop(buffer);
    }

    fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }
}

/// Builds the pool described by `config`.
pub fn from_config(config: &PoolConfig) -> Arc<dyn IoPool> {
    match config.kind {
        PoolKind::Memory => Arc::new(MemoryPool::new()),
        PoolKind::TempFile => Arc::new(TempFilePool::new(config.directory.clone())),
    }
}
