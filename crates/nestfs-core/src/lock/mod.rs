//! Per-mount-point reentrant read/write locking.
//!
//! Every mount point owns one [`ReentrantRwLock`], shared by all controllers
//! of its chain. The lock follows these rules:
//!
//! - Any number of threads may hold the read lock while nobody writes
//! - While a writer waits, threads not already reading wait behind it
//! - The writer may reacquire both the write and the read lock
//! - A thread holding only the read lock is refused the write lock with
//!   [`LockError::UpgradeRefused`] instead of deadlocking
//! - Every contended acquisition is bounded by a timeout
//!
//! Cascading operations lock child mount points before their parents, never
//! the other way round.

mod metrics;

pub use metrics::{LockMetrics, LockMetricsSnapshot};

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{trace, warn};

/// Which side of the lock an acquisition asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => f.write_str("read"),
            LockMode::Write => f.write_str("write"),
        }
    }
}

/// Errors from lock acquisition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("timed out after {timeout:?} waiting for the {mode} lock of {resource}")]
    Timeout {
        resource: String,
        mode: LockMode,
        timeout: Duration,
    },

    #[error("the current thread holds the read lock of {resource} and cannot upgrade to the write lock")]
    UpgradeRefused { resource: String },
}

#[derive(Debug, Default)]
struct LockState {
    writer: Option<ThreadId>,
    write_holds: usize,
    waiting_writers: usize,
    readers: HashMap<ThreadId, usize>,
}

impl LockState {
    // Reentrant reads pass a waiting writer, which waits for them anyway.
    fn can_read(&self, me: ThreadId) -> bool {
        match self.writer {
            Some(writer) => writer == me,
            None => self.waiting_writers == 0 || self.readers.contains_key(&me),
        }
    }

    fn can_write(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }
}

/// A reentrant read/write lock with bounded waits and explicit upgrade
/// refusal.
pub struct ReentrantRwLock {
    resource: String,
    state: Mutex<LockState>,
    cond: Condvar,
    timeout: Duration,
    metrics: LockMetrics,
}

impl ReentrantRwLock {
    /// Creates a lock; `resource` names it in errors and logs.
    pub fn new(resource: impl Into<String>, timeout: Duration) -> Self {
        Self {
            resource: resource.into(),
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
            timeout,
            metrics: LockMetrics::new(),
        }
    }

    pub fn metrics(&self) -> &LockMetrics {
        &self.metrics
    }

    /// Acquires the read lock.
    pub fn read(&self) -> Result<ReadGuard<'_>, LockError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if !state.can_read(me) {
            self.metrics.record_contended();
            let deadline = Instant::now() + self.timeout;
            while !state.can_read(me) {
                if self.cond.wait_until(&mut state, deadline).timed_out() && !state.can_read(me) {
                    return Err(self.timed_out(LockMode::Read));
                }
            }
        }
        *state.readers.entry(me).or_insert(0) += 1;
        self.metrics.record_read();
        trace!(resource = %self.resource, "read lock acquired");
        Ok(ReadGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Acquires the write lock.
    ///
    /// Fails immediately with [`LockError::UpgradeRefused`] if the current
    /// thread holds the read lock but not the write lock.
    pub fn write(&self) -> Result<WriteGuard<'_>, LockError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer == Some(me) {
            state.write_holds += 1;
            self.metrics.record_write();
            return Ok(WriteGuard {
                lock: self,
                _not_send: PhantomData,
            });
        }
        if state.readers.contains_key(&me) {
            self.metrics.record_refused_upgrade();
            warn!(resource = %self.resource, "refused read to write lock upgrade");
            return Err(LockError::UpgradeRefused {
                resource: self.resource.clone(),
            });
        }
        if !state.can_write() {
            self.metrics.record_contended();
            let deadline = Instant::now() + self.timeout;
            self.wait_for_write(&mut state, deadline)?;
        }
        state.writer = Some(me);
        state.write_holds = 1;
        self.metrics.record_write();
        trace!(resource = %self.resource, "write lock acquired");
        Ok(WriteGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Whether the current thread holds the write lock.
    pub fn is_write_locked_by_current_thread(&self) -> bool {
        self.state.lock().writer == Some(thread::current().id())
    }

    /// Temporarily releases all holds of the current thread and waits until
    /// `condition` holds or `timeout` elapses, then reacquires the same holds.
    ///
    /// Returns whether the condition was met. Used by sync to let other
    /// threads finish closing resources that need this lock.
    pub fn await_condition<F>(&self, timeout: Duration, mut condition: F) -> Result<bool, LockError>
    where
        F: FnMut() -> bool,
    {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let write_holds = if state.writer == Some(me) {
            state.writer = None;
            std::mem::take(&mut state.write_holds)
        } else {
            0
        };
        let read_holds = state.readers.remove(&me).unwrap_or(0);
        self.cond.notify_all();

        let deadline = Instant::now() + timeout;
        let met = loop {
            if condition() {
                break true;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break condition();
            }
        };

        if write_holds > 0 || read_holds > 0 {
            let deadline = Instant::now() + self.timeout;
            if write_holds > 0 {
                self.wait_for_write(&mut state, deadline)?;
                state.writer = Some(me);
                state.write_holds = write_holds;
            } else {
                while !state.can_read(me) {
                    if self.cond.wait_until(&mut state, deadline).timed_out() && !state.can_read(me) {
                        return Err(self.timed_out(LockMode::Read));
                    }
                }
            }
            if read_holds > 0 {
                state.readers.insert(me, read_holds);
            }
        }
        Ok(met)
    }

    /// Wakes threads blocked in [`await_condition`](Self::await_condition).
    pub fn signal(&self) {
        let _state = self.state.lock();
        self.cond.notify_all();
    }

    fn wait_for_write(
        &self,
        state: &mut MutexGuard<'_, LockState>,
        deadline: Instant,
    ) -> Result<(), LockError> {
        state.waiting_writers += 1;
        let mut timed_out = false;
        while !state.can_write() {
            if self.cond.wait_until(state, deadline).timed_out() && !state.can_write() {
                timed_out = true;
                break;
            }
        }
        state.waiting_writers -= 1;
        if timed_out {
            // Readers held back by this writer may proceed now.
            self.cond.notify_all();
            return Err(self.timed_out(LockMode::Write));
        }
        Ok(())
    }

    fn timed_out(&self, mode: LockMode) -> LockError {
        self.metrics.record_timeout();
        warn!(resource = %self.resource, %mode, timeout = ?self.timeout, "lock acquisition timed out");
        LockError::Timeout {
            resource: self.resource.clone(),
            mode,
            timeout: self.timeout,
        }
    }

    fn release_read(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if let Some(count) = state.readers.get_mut(&me) {
            *count -= 1;
            if *count == 0 {
                state.readers.remove(&me);
            }
        }
        self.cond.notify_all();
    }

    fn release_write(&self) {
        let mut state = self.state.lock();
        state.write_holds = state.write_holds.saturating_sub(1);
        if state.write_holds == 0 {
            state.writer = None;
        }
        self.cond.notify_all();
    }
}

impl fmt::Debug for ReentrantRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantRwLock")
            .field("resource", &self.resource)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Read hold on a [`ReentrantRwLock`]. Released on drop.
///
/// Holds are per thread, so guards cannot be sent to another thread.
#[must_use = "the lock is released when the guard is dropped"]
pub struct ReadGuard<'a> {
    lock: &'a ReentrantRwLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// Write hold on a [`ReentrantRwLock`]. Released on drop.
#[must_use = "the lock is released when the guard is dropped"]
pub struct WriteGuard<'a> {
    lock: &'a ReentrantRwLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    fn lock(timeout_ms: u64) -> ReentrantRwLock {
        ReentrantRwLock::new("test", Duration::from_millis(timeout_ms))
    }

    #[test]
    fn test_write_is_reentrant() {
        let lock = lock(100);
        let _a = lock.write().unwrap();
        let _b = lock.write().unwrap();
        let _c = lock.read().unwrap();
        assert!(lock.is_write_locked_by_current_thread());
    }

    #[test]
    fn test_upgrade_is_refused() {
        let lock = lock(100);
        let _read = lock.read().unwrap();
        assert!(matches!(
            lock.write(),
            Err(LockError::UpgradeRefused { .. })
        ));
        assert_eq!(lock.metrics().snapshot().refused_upgrades, 1);
    }

    #[test]
    fn test_released_after_drop() {
        let lock = lock(100);
        drop(lock.write().unwrap());
        drop(lock.read().unwrap());
        assert!(!lock.is_write_locked_by_current_thread());
        let _w = lock.write().unwrap();
    }

    #[test]
    fn test_contended_write_times_out() {
        let lock = Arc::new(lock(50));
        let held = Arc::new(Barrier::new(2));
        let done = Arc::new(Barrier::new(2));

        let holder = {
            let lock = Arc::clone(&lock);
            let held = Arc::clone(&held);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let _r = lock.read().unwrap();
                held.wait();
                done.wait();
            })
        };

        held.wait();
        let result = lock.write();
        assert!(matches!(
            result,
            Err(LockError::Timeout {
                mode: LockMode::Write,
                ..
            })
        ));
        drop(result);
        done.wait();
        holder.join().unwrap();
        assert_eq!(lock.metrics().snapshot().timeouts, 1);
    }

    #[test]
    fn test_writers_are_mutually_exclusive() {
        let lock = Arc::new(lock(5_000));
        let inside = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                let overlaps = Arc::clone(&overlaps);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..50 {
                        if i % 2 == 0 {
                            let _w = lock.write().unwrap();
                            if inside.swap(true, Ordering::SeqCst) {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            thread::yield_now();
                            inside.store(false, Ordering::SeqCst);
                        } else {
                            let _r = lock.read().unwrap();
                            if inside.load(Ordering::SeqCst) {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_waiting_writer_goes_before_new_readers() {
        let lock = Arc::new(lock(5_000));
        let writer_waiting = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let wrote = Arc::new(AtomicBool::new(false));

        let holder = {
            let lock = Arc::clone(&lock);
            let writer_waiting = Arc::clone(&writer_waiting);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                let _r = lock.read().unwrap();
                writer_waiting.wait();
                // A held read lock can be taken again past the waiting writer.
                let _again = lock.read().unwrap();
                release.wait();
            })
        };
        while lock.metrics().snapshot().read_acquisitions == 0 {
            thread::yield_now();
        }

        let writer = {
            let lock = Arc::clone(&lock);
            let wrote = Arc::clone(&wrote);
            thread::spawn(move || {
                let _w = lock.write().unwrap();
                wrote.store(true, Ordering::SeqCst);
            })
        };
        while lock.metrics().snapshot().contended == 0 {
            thread::yield_now();
        }
        writer_waiting.wait();

        let reader = {
            let lock = Arc::clone(&lock);
            let wrote = Arc::clone(&wrote);
            thread::spawn(move || {
                let _r = lock.read().unwrap();
                wrote.load(Ordering::SeqCst)
            })
        };
        while lock.metrics().snapshot().contended < 2 {
            thread::yield_now();
        }
        release.wait();

        holder.join().unwrap();
        writer.join().unwrap();
        assert!(reader.join().unwrap(), "reader overtook the waiting writer");
        assert_eq!(lock.metrics().snapshot().timeouts, 0);
    }

    #[test]
    fn test_await_condition_releases_write_lock() {
        let lock = Arc::new(lock(5_000));
        let flag = Arc::new(AtomicBool::new(false));
        let _w = lock.write().unwrap();
        let _w2 = lock.write().unwrap();

        let other = {
            let lock = Arc::clone(&lock);
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                let _w = lock.write().unwrap();
                flag.store(true, Ordering::SeqCst);
                drop(_w);
                lock.signal();
            })
        };

        let met = lock
            .await_condition(Duration::from_secs(5), || flag.load(Ordering::SeqCst))
            .unwrap();
        assert!(met);
        assert!(lock.is_write_locked_by_current_thread());
        other.join().unwrap();
    }
}
