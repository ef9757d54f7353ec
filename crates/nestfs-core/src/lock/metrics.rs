//! Counters kept by every mount point lock.

use std::sync::atomic::{AtomicU64, Ordering};

/// Acquisition, contention and refusal counts of one [`ReentrantRwLock`].
///
/// [`ReentrantRwLock`]: super::ReentrantRwLock
#[derive(Debug, Default)]
pub struct LockMetrics {
    /// Number of read lock acquisitions, reentrant ones included
    pub read_acquisitions: AtomicU64,

    /// Number of write lock acquisitions, reentrant ones included
    pub write_acquisitions: AtomicU64,

    /// Number of acquisitions that had to wait for another thread
    pub contended: AtomicU64,

    /// Number of acquisitions that gave up after the timeout
    pub timeouts: AtomicU64,

    /// Number of refused read-to-write upgrades
    pub refused_upgrades: AtomicU64,
}

impl LockMetrics {
    /// All counters start at zero.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_read(&self) {
        self.read_acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_write(&self) {
        self.write_acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_contended(&self) {
        self.contended.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_refused_upgrade(&self) {
        self.refused_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters. Counters are read one at a time, so a snapshot
    /// taken under contention may mix values from neighbouring instants.
    pub fn snapshot(&self) -> LockMetricsSnapshot {
        LockMetricsSnapshot {
            read_acquisitions: self.read_acquisitions.load(Ordering::Relaxed),
            write_acquisitions: self.write_acquisitions.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            refused_upgrades: self.refused_upgrades.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.read_acquisitions.store(0, Ordering::Relaxed);
        self.write_acquisitions.store(0, Ordering::Relaxed);
        self.contended.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.refused_upgrades.store(0, Ordering::Relaxed);
    }
}

/// Counter values copied out of [`LockMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockMetricsSnapshot {
    pub read_acquisitions: u64,
    pub write_acquisitions: u64,
    pub contended: u64,
    pub timeouts: u64,
    pub refused_upgrades: u64,
}

impl LockMetricsSnapshot {
    /// Fraction of acquisitions that had to wait, 0.0 to 1.0
    #[allow(clippy::cast_precision_loss)]
    pub fn contention_rate(&self) -> f64 {
        let total = self.read_acquisitions + self.write_acquisitions;
        if total == 0 {
            0.0
        } else {
            self.contended as f64 / total as f64
        }
    }
}
