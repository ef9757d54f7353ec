//! Tests of the sync protocol: ordering, aggregation and open resources.

mod common;

use std::io::{Read, Write};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{TestFederation, assert_content, init_tracing};
use nestfs_core::archive::{ArchiveEntry, ArchiveInput, ArchiveOutput, DriverError};
use nestfs_core::pool::{IoPool, MemoryPool};
use nestfs_core::sync::{Severity, SyncIssueKind};
use nestfs_core::testing::{JsonArchiveDriver, test_detector, test_registry};
use nestfs_core::{
    AccessOptions, ArchiveDetector, ArchiveDriver, DriverRegistry, Federation, FsError,
    KernelConfig, Manager, MemoryStore, MountPoint, SyncOptions,
};
use parking_lot::Mutex;

/// JSON archives that log the entry names of every archive they encode.
#[derive(Debug, Clone, Default)]
struct RecordingDriver {
    encoded: Arc<Mutex<Vec<Vec<String>>>>,
}

impl ArchiveDriver for RecordingDriver {
    fn open(&self, bytes: Vec<u8>) -> Result<Box<dyn ArchiveInput>, DriverError> {
        JsonArchiveDriver.open(bytes)
    }

    fn create(&self) -> Result<Box<dyn ArchiveOutput>, DriverError> {
        Ok(Box::new(RecordingOutput {
            inner: JsonArchiveDriver.create()?,
            names: Vec::new(),
            encoded: Arc::clone(&self.encoded),
        }))
    }
}

struct RecordingOutput {
    inner: Box<dyn ArchiveOutput>,
    names: Vec<String>,
    encoded: Arc<Mutex<Vec<Vec<String>>>>,
}

impl ArchiveOutput for RecordingOutput {
    fn put(&mut self, entry: &ArchiveEntry, data: &[u8]) -> Result<(), DriverError> {
        self.names.push(entry.name.to_string());
        self.inner.put(entry, data)
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>, DriverError> {
        let RecordingOutput {
            inner,
            names,
            encoded,
        } = *self;
        let bytes = inner.finish()?;
        encoded.lock().push(names);
        Ok(bytes)
    }
}

#[test]
fn test_commit_order_is_children_first() {
    init_tracing();
    let driver = RecordingDriver::default();
    let store = Arc::new(MemoryStore::new());
    let registry = DriverRegistry::with_defaults(Arc::clone(&store))
        .with_archive("zip", driver.clone())
        .unwrap();
    let fed = Federation::new(
        Arc::new(Manager::new(registry, KernelConfig::default())),
        MountPoint::new("mem:/").unwrap(),
        ArchiveDetector::new().with("zip", "zip").unwrap(),
    )
    .unwrap();

    fed.write_all("a.zip/a.txt", b"a").unwrap();
    fed.write_all("a.zip/b.zip/b.txt", b"b").unwrap();
    fed.write_all("a.zip/b.zip/c.zip/c.txt", b"c").unwrap();
    fed.sync(SyncOptions::SYNC).unwrap();

    let encoded = driver.encoded.lock().clone();
    let order: Vec<&str> = encoded
        .iter()
        .map(|names| {
            names
                .iter()
                .find(|name| name.ends_with(".txt"))
                .map_or("", String::as_str)
        })
        .collect();
    assert_eq!(order, vec!["c.txt", "b.txt", "a.txt"]);
}

#[test]
fn test_children_commit_before_parents() {
    let fixture = TestFederation::new();
    let fed = &fixture.federation;
    fed.write_all("a.zip/b.zip/c.zip/deep.txt", b"deep").unwrap();
    fed.write_all("a.zip/b.zip/mid.txt", b"mid").unwrap();

    let manager = fed.manager();
    assert_eq!(manager.len(), 4);
    fed.sync(SyncOptions::SYNC).unwrap();
    // A parent committed before its child would have been touched again by
    // the child's commit and stayed registered.
    assert!(manager.is_empty());

    let fresh = fixture.reopen();
    assert_content(&fresh, "a.zip/b.zip/c.zip/deep.txt", b"deep");
    assert_content(&fresh, "a.zip/b.zip/mid.txt", b"mid");
}

#[test]
fn test_failures_are_aggregated_and_others_commit() {
    let fixture = TestFederation::new();
    let fed = &fixture.federation;
    fed.write_all("a.zip/one.txt", b"1").unwrap();
    fed.write_all("b.broken/two.txt", b"2").unwrap();
    fed.write_all("c.zip/three.txt", b"3").unwrap();

    let error = fed.sync(SyncOptions::SYNC).unwrap_err();
    assert!(!error.is_warning());
    assert_eq!(error.issues().len(), 1);
    let issue = &error.issues()[0];
    assert_eq!(issue.mount_point.uri(), "broken:mem:/b.broken!/");
    assert_eq!(issue.severity, Severity::Error);
    assert!(matches!(issue.kind, SyncIssueKind::Commit(FsError::Driver { .. })));

    let manager = fed.manager();
    assert!(!manager.is_registered(&fixture.mount_point("a.zip/")));
    assert!(!manager.is_registered(&fixture.mount_point("c.zip/")));
    assert!(manager.is_registered(&fixture.mount_point("b.broken/")));

    let fresh = fixture.reopen();
    assert_content(&fresh, "a.zip/one.txt", b"1");
    assert_content(&fresh, "c.zip/three.txt", b"3");

    // The failed archive keeps its changes for a later attempt.
    assert_content(fed, "b.broken/two.txt", b"2");
}

#[test]
fn test_sync_refuses_own_open_resources_without_force() {
    let fixture = TestFederation::new();
    let fed = &fixture.federation;
    fed.write_all("a.zip/f", b"content").unwrap();
    let reader = fed.read(AccessOptions::empty(), "a.zip/f").unwrap();

    let error = fed.sync(SyncOptions::SYNC).unwrap_err();
    assert!(!error.is_warning());
    assert!(error.issues().iter().any(|issue| matches!(
        issue.kind,
        SyncIssueKind::OpenResources {
            inputs: 1,
            outputs: 0
        }
    )));
    assert!(fed.manager().is_registered(&fixture.mount_point("a.zip/")));

    drop(reader);
    fed.sync(SyncOptions::SYNC).unwrap();
}

#[test]
fn test_forced_close_is_a_warning() {
    let fixture = TestFederation::new();
    let fed = &fixture.federation;
    fed.write_all("a.zip/f", b"content").unwrap();
    let mut reader = fed.read(AccessOptions::empty(), "a.zip/f").unwrap();
    let mut writer = fed.write(AccessOptions::CREATE_PARENTS, "a.zip/g").unwrap();
    writer.write_all(b"flushed by sync").unwrap();

    let warning = fed.sync(SyncOptions::UMOUNT).unwrap_err();
    assert!(warning.is_warning());
    assert_eq!(warning.severity(), Severity::Warning);
    assert!(warning.issues().iter().any(|issue| matches!(
        issue.kind,
        SyncIssueKind::ForcedClose {
            inputs: 1,
            outputs: 1
        }
    )));

    let mut buf = Vec::new();
    assert!(reader.read_to_end(&mut buf).is_err());
    assert!(writer.is_closed());
    assert!(matches!(writer.close(), Err(FsError::ResourceClosed { .. })));

    // Warnings still evict and commit.
    assert!(fed.manager().is_empty());
    assert_content(&fixture.reopen(), "a.zip/g", b"flushed by sync");
}

#[test]
fn test_sync_waits_for_other_threads() {
    let fixture = TestFederation::new();
    let fed = Arc::new(fixture.federation);
    fed.write_all("a.zip/seed", b"").unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let worker = {
        let fed = Arc::clone(&fed);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            let mut writer = fed.write(AccessOptions::empty(), "a.zip/late.txt").unwrap();
            barrier.wait();
            thread::sleep(Duration::from_millis(100));
            writer.write_all(b"late").unwrap();
            writer.close().unwrap();
        })
    };

    barrier.wait();
    fed.sync(SyncOptions::SYNC).unwrap();
    worker.join().unwrap();

    let fresh = test_federation_over(&fixture.store);
    assert_content(&fresh, "a.zip/late.txt", b"late");
}

#[test]
fn test_wait_times_out_as_error() {
    let config = KernelConfig {
        sync_wait_timeout: Duration::from_millis(50),
        ..KernelConfig::default()
    };
    let fixture = TestFederation::with_config(config);
    let fed = Arc::new(fixture.federation);
    fed.write_all("a.zip/f", b"x").unwrap();

    let (opened_tx, opened_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let holder = {
        let fed = Arc::clone(&fed);
        thread::spawn(move || {
            let reader = fed.read(AccessOptions::empty(), "a.zip/f").unwrap();
            opened_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            drop(reader);
        })
    };

    opened_rx.recv().unwrap();
    let error = fed.sync(SyncOptions::SYNC).unwrap_err();
    assert!(!error.is_warning());
    release_tx.send(()).unwrap();
    holder.join().unwrap();
    fed.sync(SyncOptions::SYNC).unwrap();
}

#[test]
fn test_every_buffer_is_released() {
    let pool = Arc::new(MemoryPool::new());
    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(Manager::with_pool(
        test_registry(Arc::clone(&store)).unwrap(),
        KernelConfig::default(),
        Arc::clone(&pool) as Arc<dyn IoPool>,
    ));
    let fed = Federation::new(
        manager,
        MountPoint::new("mem:/").unwrap(),
        test_detector().unwrap(),
    )
    .unwrap();

    fed.write_all("a.zip/one", b"1").unwrap();
    fed.write_all("a.zip/two", b"2").unwrap();
    fed.write_all("plain.txt", b"3").unwrap();
    // Failing operations must not leak either.
    assert!(fed.write(AccessOptions::EXCLUSIVE, "a.zip/one").is_err());
    fed.mknod(AccessOptions::empty(), "a.zip/dir", nestfs_core::NodeType::Directory)
        .unwrap();
    assert!(fed.write(AccessOptions::empty(), "a.zip/dir").is_err());
    drop(fed.write(AccessOptions::empty(), "a.zip/dropped").unwrap());
    fed.write_all("b.broken/x", b"x").unwrap();
    assert!(fed.sync(SyncOptions::UMOUNT).is_err());
    fed.sync(SyncOptions::RESET).unwrap();

    let stats = pool.stats();
    assert!(stats.allocated > 0);
    assert_eq!(stats.live(), 0, "leaked buffers: {stats:?}");
}

fn test_federation_over(store: &Arc<MemoryStore>) -> Federation {
    nestfs_core::testing::test_federation(Arc::clone(store), KernelConfig::default()).unwrap()
}
