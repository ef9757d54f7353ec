//! Common utilities for kernel integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use nestfs_core::testing::test_federation;
use nestfs_core::{Federation, FsError, KernelConfig, MemoryStore, MountPoint};

static TRACING: Once = Once::new();

/// Installs a tracing subscriber honoring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A federation rooted at `mem:/` over a fresh store.
pub struct TestFederation {
    pub store: Arc<MemoryStore>,
    pub federation: Federation,
}

impl TestFederation {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let federation =
            test_federation(Arc::clone(&store), config).expect("failed to build federation");
        Self { store, federation }
    }

    /// A second federation with its own manager over the same store.
    pub fn reopen(&self) -> Federation {
        test_federation(Arc::clone(&self.store), KernelConfig::default())
            .expect("failed to build federation")
    }

    pub fn mount_point(&self, path: &str) -> MountPoint {
        self.federation
            .resolve(path)
            .unwrap_or_else(|e| panic!("failed to resolve {path}: {e}"))
            .mount_point()
            .clone()
    }
}

/// Asserts that `path` reads as `expected`.
pub fn assert_content(federation: &Federation, path: &str, expected: &[u8]) {
    let actual = federation
        .read_to_vec(path)
        .unwrap_or_else(|e| panic!("failed to read {path}: {e}"));
    assert_eq!(
        actual,
        expected,
        "content mismatch for {path}: expected {:?}, got {:?}",
        String::from_utf8_lossy(expected),
        String::from_utf8_lossy(&actual)
    );
}

/// Asserts that reading `path` fails because it does not exist.
pub fn assert_not_found(federation: &Federation, path: &str) {
    match federation.read_to_vec(path) {
        Ok(_) => panic!("expected {path} to not exist"),
        Err(e) if e.io_kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => panic!("expected NotFound for {path}, got: {e}"),
    }
}

pub fn is_not_found(result: &Result<Vec<u8>, FsError>) -> bool {
    matches!(result, Err(e) if e.io_kind() == std::io::ErrorKind::NotFound)
}
