//! Concurrency tests of the controller registry and the lock decorator.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{TestFederation, assert_content, init_tracing};
use nestfs_core::archive::{Node, NodeType, Times};
use nestfs_core::controller::{ControllerModel, LockController};
use nestfs_core::lock::LockError;
use nestfs_core::pool::MemoryPool;
use nestfs_core::resource::{EntryReader, EntryWriter};
use nestfs_core::{
    AccessOptions, AccessTypes, Controller, EntryName, FsError, KernelConfig, MountPoint,
    SyncError, SyncOptions,
};

const THREADS: usize = 8;

#[test]
fn test_concurrent_lookups_share_one_controller() {
    let fixture = TestFederation::new();
    let manager = Arc::clone(fixture.federation.manager());
    let mount_point = fixture.mount_point("x.zip/y.zip/");
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let mount_point = mount_point.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                manager.controller(&mount_point).unwrap()
            })
        })
        .collect();
    let controllers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    for controller in &controllers[1..] {
        assert!(Arc::ptr_eq(&controllers[0], controller));
    }
    let parent = controllers[0].parent().unwrap();
    assert!(Arc::ptr_eq(
        parent,
        &manager.controller(parent.mount_point()).unwrap()
    ));
    assert_eq!(manager.len(), 3);
}

#[test]
fn test_concurrent_writers_to_one_archive() {
    let fixture = TestFederation::new();
    let fed = Arc::new(fixture.federation);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let fed = Arc::clone(&fed);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                fed.write_all(&format!("shared.zip/dir{i}/file.txt"), format!("{i}").as_bytes())
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    fed.sync(SyncOptions::UMOUNT).unwrap();

    let fresh = nestfs_core::testing::test_federation(
        Arc::clone(&fixture.store),
        KernelConfig::default(),
    )
    .unwrap();
    for i in 0..THREADS {
        assert_content(
            &fresh,
            &format!("shared.zip/dir{i}/file.txt"),
            format!("{i}").as_bytes(),
        );
    }
    assert_eq!(fresh.list("shared.zip").unwrap().len(), THREADS);
}

/// Records how many threads are inside read and write sections.
#[derive(Debug)]
struct SectionCounter {
    model: ControllerModel,
    readers: AtomicUsize,
    writers: AtomicUsize,
    violated: AtomicBool,
    max_readers: AtomicUsize,
}

impl SectionCounter {
    fn new() -> Self {
        let model = ControllerModel::new(
            MountPoint::new("mem:/counter/").unwrap(),
            None,
            Arc::new(MemoryPool::new()),
            Arc::new(KernelConfig::default()),
        );
        Self {
            model,
            readers: AtomicUsize::new(0),
            writers: AtomicUsize::new(0),
            violated: AtomicBool::new(false),
            max_readers: AtomicUsize::new(0),
        }
    }

    fn read_section(&self) {
        let readers = self.readers.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_readers.fetch_max(readers, Ordering::SeqCst);
        if self.writers.load(Ordering::SeqCst) > 0 {
            self.violated.store(true, Ordering::SeqCst);
        }
        thread::sleep(Duration::from_millis(2));
        self.readers.fetch_sub(1, Ordering::SeqCst);
    }

    fn write_section(&self) {
        if self.writers.fetch_add(1, Ordering::SeqCst) > 0
            || self.readers.load(Ordering::SeqCst) > 0
        {
            self.violated.store(true, Ordering::SeqCst);
        }
        thread::sleep(Duration::from_millis(2));
        self.writers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Controller for SectionCounter {
    fn model(&self) -> &ControllerModel {
        &self.model
    }

    fn stat(&self, _options: AccessOptions, _name: &EntryName) -> Result<Option<Node>, FsError> {
        self.read_section();
        Ok(None)
    }

    fn check_access(
        &self,
        _options: AccessOptions,
        _name: &EntryName,
        _types: AccessTypes,
    ) -> Result<(), FsError> {
        self.read_section();
        Ok(())
    }

    fn set_time(&self, _options: AccessOptions, _name: &EntryName, _times: &Times) -> Result<(), FsError> {
        self.write_section();
        Ok(())
    }

    fn input(&self, _options: AccessOptions, name: &EntryName) -> Result<EntryReader, FsError> {
        self.read_section();
        Ok(EntryReader::new(
            self.model.mount_point().resolve(name),
            Arc::from(Vec::new()),
            None,
        ))
    }

    fn output(
        &self,
        _options: AccessOptions,
        name: &EntryName,
        _template: Option<&Node>,
    ) -> Result<EntryWriter, FsError> {
        self.write_section();
        Err(FsError::ResourceClosed {
            path: self.model.mount_point().resolve(name),
        })
    }

    fn mknod(
        &self,
        _options: AccessOptions,
        _name: &EntryName,
        _node_type: NodeType,
        _template: Option<&Node>,
    ) -> Result<(), FsError> {
        self.write_section();
        Ok(())
    }

    fn unlink(&self, _options: AccessOptions, _name: &EntryName) -> Result<(), FsError> {
        self.write_section();
        Ok(())
    }

    fn sync(&self, _options: SyncOptions) -> Result<(), SyncError> {
        self.write_section();
        Ok(())
    }
}

#[test]
fn test_lock_decorator_excludes_writers() {
    init_tracing();
    let controller = Arc::new(LockController::new(SectionCounter::new()));
    let barrier = Arc::new(Barrier::new(THREADS));
    let name = EntryName::new("entry").unwrap();

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let controller = Arc::clone(&controller);
            let barrier = Arc::clone(&barrier);
            let name = name.clone();
            thread::spawn(move || {
                barrier.wait();
                for round in 0..20 {
                    if (i + round) % 3 == 0 {
                        controller
                            .mknod(AccessOptions::empty(), &name, NodeType::File, None)
                            .unwrap();
                    } else {
                        controller.stat(AccessOptions::empty(), &name).unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let counter = controller.inner();
    assert!(!counter.violated.load(Ordering::SeqCst));
    let metrics = controller.model().lock().metrics().snapshot();
    assert!(metrics.write_acquisitions > 0);
    assert!(metrics.read_acquisitions > 0);
}

#[test]
fn test_lock_is_released_on_errors() {
    let controller = LockController::new(SectionCounter::new());
    let name = EntryName::new("entry").unwrap();
    assert!(controller.output(AccessOptions::empty(), &name, None).is_err());
    // A leaked write guard would make this thread's next lookups reentrant
    // and another thread's time out.
    assert!(!controller.model().lock().is_write_locked_by_current_thread());
    thread::scope(|scope| {
        scope
            .spawn(|| controller.mknod(AccessOptions::empty(), &name, NodeType::File, None))
            .join()
            .unwrap()
            .unwrap();
    });
}

#[test]
fn test_write_under_held_read_lock_is_refused() {
    let fixture = TestFederation::new();
    let fed = &fixture.federation;
    fed.write_all("a.zip/f", b"x").unwrap();
    let controller = fed
        .manager()
        .controller(&fixture.mount_point("a.zip/"))
        .unwrap();
    let lock = Arc::clone(controller.model().lock());

    let read = lock.read().unwrap();
    assert_content(fed, "a.zip/f", b"x");
    let result = fed.write_all("a.zip/g", b"y");
    assert!(
        matches!(result, Err(FsError::Lock(LockError::UpgradeRefused { .. }))),
        "unexpected result: {result:?}"
    );
    assert!(!lock.is_write_locked_by_current_thread());
    drop(read);

    assert_eq!(lock.metrics().snapshot().refused_upgrades, 1);
    fed.write_all("a.zip/g", b"y").unwrap();
    assert_content(fed, "a.zip/g", b"y");
}

#[test]
fn test_archive_parent_is_its_directory_root() {
    let fixture = TestFederation::new();
    let fed = &fixture.federation;
    fed.write_all("a/b.zip/f", b"x").unwrap();
    let manager = fed.manager();

    let resolved = fixture.mount_point("a/b.zip/");
    let direct = MountPoint::new("zip:mem:/a/b.zip!/").unwrap();
    assert_eq!(resolved, direct);

    let archive = manager.controller(&direct).unwrap();
    let directory = manager.controller(&MountPoint::new("mem:/a/").unwrap()).unwrap();
    assert!(Arc::ptr_eq(archive.parent().unwrap(), &directory));
    assert_eq!(direct.parent().unwrap().uri(), "mem:/a/");
}
