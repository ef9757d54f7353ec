//! Open entry streams and their accounting.
//!
//! Every [`EntryReader`] and [`EntryWriter`] handed out by a controller is
//! registered with the [`ResourceAccountant`] of its mount point until it is
//! closed or dropped. Sync consults the accountant to wait for other threads
//! to close their resources, or to close them forcibly.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::addr::NodePath;
use crate::error::FsError;
use crate::lock::{LockError, ReentrantRwLock};
use crate::pool::PooledBuffer;

/// Direction of an open resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Input,
    Output,
}

/// Open resource counts of one mount point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    pub inputs: usize,
    pub outputs: usize,
}

impl ResourceCounts {
    pub fn total(&self) -> usize {
        self.inputs + self.outputs
    }

    pub fn get(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::Input => self.inputs,
            ResourceKind::Output => self.outputs,
        }
    }
}

/// A resource that sync can close on behalf of an unresponsive owner.
pub trait ForceClose: Send + Sync {
    fn force_close(&self) -> Result<(), FsError>;
}

struct Tracked {
    kind: ResourceKind,
    owner: ThreadId,
    closer: Weak<dyn ForceClose>,
}

#[derive(Default)]
struct Accounts {
    next_id: u64,
    open: HashMap<u64, Tracked>,
}

/// Registry of the open resources of one mount point.
pub struct ResourceAccountant {
    lock: Arc<ReentrantRwLock>,
    accounts: Mutex<Accounts>,
}

impl ResourceAccountant {
    pub fn new(lock: Arc<ReentrantRwLock>) -> Self {
        Self {
            lock,
            accounts: Mutex::new(Accounts::default()),
        }
    }

    /// Starts accounting for a resource until the returned registration drops.
    pub fn register(self: &Arc<Self>, kind: ResourceKind, closer: Weak<dyn ForceClose>) -> Registration {
        let mut accounts = self.accounts.lock();
        let id = accounts.next_id;
        accounts.next_id += 1;
        accounts.open.insert(
            id,
            Tracked {
                kind,
                owner: thread::current().id(),
                closer,
            },
        );
        Registration {
            accountant: Arc::clone(self),
            id,
        }
    }

    fn deregister(&self, id: u64) {
        let removed = self.accounts.lock().open.remove(&id).is_some();
        if removed {
            self.lock.signal();
        }
    }

    /// Counts all open resources.
    pub fn counts(&self) -> ResourceCounts {
        Self::count(&self.accounts.lock(), None)
    }

    /// Counts resources opened by threads other than the current one.
    pub fn counts_of_other_threads(&self) -> ResourceCounts {
        Self::count(&self.accounts.lock(), Some(thread::current().id()))
    }

    fn count(accounts: &Accounts, exclude: Option<ThreadId>) -> ResourceCounts {
        let mut counts = ResourceCounts::default();
        for tracked in accounts.open.values() {
            if Some(tracked.owner) == exclude {
                continue;
            }
            match tracked.kind {
                ResourceKind::Input => counts.inputs += 1,
                ResourceKind::Output => counts.outputs += 1,
            }
        }
        counts
    }

    /// Waits until other threads have closed all their resources of the
    /// given kinds, or `timeout` elapses.
    ///
    /// The mount point lock is released while waiting so that closing
    /// writers can commit. Returns whether the wait succeeded.
    pub fn wait_for_other_threads(
        &self,
        inputs: bool,
        outputs: bool,
        timeout: Duration,
    ) -> Result<bool, LockError> {
        self.lock.await_condition(timeout, || {
            let counts = self.counts_of_other_threads();
            (!inputs || counts.inputs == 0) && (!outputs || counts.outputs == 0)
        })
    }

    /// Forcibly closes all resources of `kind`.
    ///
    /// Returns the number of closed resources and the errors of those that
    /// failed to close cleanly.
    pub fn close_all(&self, kind: ResourceKind) -> (usize, Vec<FsError>) {
        let closers: Vec<Arc<dyn ForceClose>> = {
            let mut accounts = self.accounts.lock();
            let ids: Vec<u64> = accounts
                .open
                .iter()
                .filter(|(_, t)| t.kind == kind)
                .map(|(&id, _)| id)
                .collect();
            ids.into_iter()
                .filter_map(|id| accounts.open.remove(&id))
                .filter_map(|t| t.closer.upgrade())
                .collect()
        };
        let count = closers.len();
        let errors = closers
            .into_iter()
            .filter_map(|closer| closer.force_close().err())
            .collect();
        if count > 0 {
            debug!(?kind, count, "forcibly closed resources");
        }
        self.lock.signal();
        (count, errors)
    }
}

impl fmt::Debug for ResourceAccountant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceAccountant")
            .field("counts", &self.counts())
            .finish_non_exhaustive()
    }
}

/// Keeps a resource accounted for until dropped.
pub struct Registration {
    accountant: Arc<ResourceAccountant>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.accountant.deregister(self.id);
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Registration").field(&self.id).finish()
    }
}

#[derive(Debug, Default)]
struct ReaderState {
    closed: AtomicBool,
}

impl ForceClose for ReaderState {
    fn force_close(&self) -> Result<(), FsError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// A readable, seekable view of one entry's content.
///
/// Content is shared, so cloning it for a cache is free.
pub struct EntryReader {
    path: NodePath,
    cursor: Cursor<Arc<[u8]>>,
    state: Arc<ReaderState>,
    registration: Option<Registration>,
}

impl EntryReader {
    /// Creates a reader, accounted for by `accountant` if given.
    pub fn new(path: NodePath, data: Arc<[u8]>, accountant: Option<&Arc<ResourceAccountant>>) -> Self {
        let state = Arc::new(ReaderState::default());
        let registration = accountant.map(|a| {
            let closer: Arc<dyn ForceClose> = state.clone();
            a.register(ResourceKind::Input, Arc::downgrade(&closer))
        });
        Self {
            path,
            cursor: Cursor::new(data),
            state,
            registration,
        }
    }

    pub fn path(&self) -> &NodePath {
        &self.path
    }

    /// Total content length.
    pub fn len(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Reads the remaining content.
    pub fn read_all(&mut self) -> Result<Vec<u8>, FsError> {
        let mut out = Vec::new();
        self.read_to_end(&mut out)
            .map_err(|e| FsError::io(&self.path, e))?;
        Ok(out)
    }

    /// Closes the reader and returns its complete content.
    pub fn into_shared(mut self) -> Result<Arc<[u8]>, FsError> {
        self.ensure_open()?;
        self.registration.take();
        Ok(Arc::clone(self.cursor.get_ref()))
    }

    pub fn close(mut self) {
        self.registration.take();
    }

    fn ensure_open(&self) -> Result<(), FsError> {
        if self.is_closed() {
            return Err(FsError::ResourceClosed {
                path: self.path.clone(),
            });
        }
        Ok(())
    }
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;
        self.cursor.read(buf)
    }
}

impl Seek for EntryReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.ensure_open()?;
        self.cursor.seek(pos)
    }
}

impl fmt::Debug for EntryReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryReader")
            .field("path", &self.path.to_string())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receives the content of a closed [`EntryWriter`].
pub trait OutputSink: Send + Sync {
    fn commit(&self, buffer: PooledBuffer) -> Result<(), FsError>;
}

type CommitHook = Box<dyn FnOnce() + Send>;

struct WriterSlot {
    path: NodePath,
    buffer: Mutex<Option<PooledBuffer>>,
    sink: Box<dyn OutputSink>,
    hooks: Mutex<Vec<CommitHook>>,
}

impl WriterSlot {
    /// Commits the buffer once; later calls are no-ops.
    fn finish(&self) -> Result<(), FsError> {
        let Some(buffer) = self.buffer.lock().take() else {
            return Ok(());
        };
        let result = self.sink.commit(buffer);
        for hook in std::mem::take(&mut *self.hooks.lock()) {
            hook();
        }
        result
    }
}

impl ForceClose for WriterSlot {
    fn force_close(&self) -> Result<(), FsError> {
        self.finish()
    }
}

/// A writable stream for one entry.
///
/// Written bytes are buffered in pooled temporary storage and committed to
/// the file system when the writer is closed or dropped.
pub struct EntryWriter {
    slot: Arc<WriterSlot>,
    registration: Option<Registration>,
}

impl EntryWriter {
    pub fn new(
        path: NodePath,
        buffer: PooledBuffer,
        sink: Box<dyn OutputSink>,
        accountant: Option<&Arc<ResourceAccountant>>,
    ) -> Self {
        let slot = Arc::new(WriterSlot {
            path,
            buffer: Mutex::new(Some(buffer)),
            sink,
            hooks: Mutex::new(Vec::new()),
        });
        let registration = accountant.map(|a| {
            let closer: Arc<dyn ForceClose> = slot.clone();
            a.register(ResourceKind::Output, Arc::downgrade(&closer))
        });
        Self { slot, registration }
    }

    pub fn path(&self) -> &NodePath {
        &self.slot.path
    }

    /// Runs `hook` after the content has been committed.
    pub fn on_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.slot.hooks.lock().push(Box::new(hook));
    }

    pub fn is_closed(&self) -> bool {
        self.slot.buffer.lock().is_none()
    }

    /// Commits the written content.
    ///
    /// Fails with [`FsError::ResourceClosed`] if sync closed this writer
    /// forcibly before.
    pub fn close(mut self) -> Result<(), FsError> {
        if self.is_closed() {
            return Err(FsError::ResourceClosed {
                path: self.slot.path.clone(),
            });
        }
        let result = self.slot.finish();
        self.registration.take();
        result
    }
}

impl Write for EntryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.slot.buffer.lock();
        let buffer = guard.as_mut().ok_or_else(|| {
            io::Error::from(FsError::ResourceClosed {
                path: self.slot.path.clone(),
            })
        })?;
        buffer.append(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EntryWriter {
    fn drop(&mut self) {
        if let Err(e) = self.slot.finish() {
            warn!(path = %self.slot.path, error = %e, "dropped writer failed to commit");
        }
    }
}

impl fmt::Debug for EntryWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryWriter")
            .field("path", &self.slot.path.to_string())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{IoPool, MemoryPool};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Capture {
        data: Mutex<Vec<u8>>,
        commits: AtomicUsize,
    }

    struct CaptureSink(Arc<Capture>);

    impl OutputSink for CaptureSink {
        fn commit(&self, mut buffer: PooledBuffer) -> Result<(), FsError> {
            *self.0.data.lock() = buffer.read_all().map_err(|e| FsError::io("capture", e))?;
            self.0.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn accountant() -> Arc<ResourceAccountant> {
        Arc::new(ResourceAccountant::new(Arc::new(ReentrantRwLock::new(
            "test",
            Duration::from_secs(1),
        ))))
    }

    fn path() -> NodePath {
        NodePath::new("mem:/file.txt").unwrap()
    }

    #[test]
    fn test_reader_is_accounted_until_dropped() {
        let accountant = accountant();
        let mut reader = EntryReader::new(path(), Arc::from(&b"abc"[..]), Some(&accountant));
        assert_eq!(accountant.counts().inputs, 1);
        assert_eq!(reader.read_all().unwrap(), b"abc");
        drop(reader);
        assert_eq!(accountant.counts(), ResourceCounts::default());
    }

    #[test]
    fn test_forced_reader_close_fails_reads() {
        let accountant = accountant();
        let mut reader = EntryReader::new(path(), Arc::from(&b"abc"[..]), Some(&accountant));
        let (closed, errors) = accountant.close_all(ResourceKind::Input);
        assert_eq!(closed, 1);
        assert!(errors.is_empty());
        assert!(reader.is_closed());
        let mut buf = [0u8; 3];
        assert!(reader.read(&mut buf).is_err());
    }

    #[test]
    fn test_writer_commits_once_and_releases_buffer() {
        let pool: Arc<dyn IoPool> = Arc::new(MemoryPool::new());
        let capture = Arc::new(Capture::default());
        let accountant = accountant();
        let hook_ran = Arc::new(AtomicBool::new(false));

        let mut writer = EntryWriter::new(
            path(),
            PooledBuffer::allocate(&pool).unwrap(),
            Box::new(CaptureSink(Arc::clone(&capture))),
            Some(&accountant),
        );
        let flag = Arc::clone(&hook_ran);
        writer.on_commit(move || flag.store(true, Ordering::SeqCst));
        writer.write_all(b"hi").unwrap();
        assert_eq!(accountant.counts().outputs, 1);
        writer.close().unwrap();

        assert_eq!(*capture.data.lock(), b"hi");
        assert_eq!(capture.commits.load(Ordering::SeqCst), 1);
        assert!(hook_ran.load(Ordering::SeqCst));
        assert_eq!(accountant.counts().outputs, 0);
        assert_eq!(pool.stats().live(), 0);
    }

    #[test]
    fn test_forced_writer_close_commits_and_rejects_later_close() {
        let pool: Arc<dyn IoPool> = Arc::new(MemoryPool::new());
        let capture = Arc::new(Capture::default());
        let accountant = accountant();
        let mut writer = EntryWriter::new(
            path(),
            PooledBuffer::allocate(&pool).unwrap(),
            Box::new(CaptureSink(Arc::clone(&capture))),
            Some(&accountant),
        );
        writer.write_all(b"data").unwrap();

        let (closed, _) = accountant.close_all(ResourceKind::Output);
        assert_eq!(closed, 1);
        assert_eq!(*capture.data.lock(), b"data");
        assert!(writer.write_all(b"more").is_err());
        assert!(matches!(writer.close(), Err(FsError::ResourceClosed { .. })));
        assert_eq!(capture.commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_writer_commits() {
        let pool: Arc<dyn IoPool> = Arc::new(MemoryPool::new());
        let capture = Arc::new(Capture::default());
        {
            let mut writer = EntryWriter::new(
                path(),
                PooledBuffer::allocate(&pool).unwrap(),
                Box::new(CaptureSink(Arc::clone(&capture))),
                None,
            );
            writer.write_all(b"x").unwrap();
        }
        assert_eq!(*capture.data.lock(), b"x");
    }

    #[test]
    fn test_counts_of_other_threads() {
        let accountant = accountant();
        let _mine = EntryReader::new(path(), Arc::from(&b""[..]), Some(&accountant));
        assert_eq!(accountant.counts_of_other_threads().total(), 0);

        let other = Arc::clone(&accountant);
        let handle = thread::spawn(move || EntryReader::new(path(), Arc::from(&b""[..]), Some(&other)));
        let theirs = handle.join().unwrap();
        assert_eq!(accountant.counts_of_other_threads().inputs, 1);
        drop(theirs);
        assert_eq!(accountant.counts_of_other_threads().inputs, 0);
    }
}
