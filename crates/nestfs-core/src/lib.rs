//! Kernel of an archive-transparent federated virtual file system.
//!
//! Paths may traverse archive files as if they were directories. Each file
//! system instance, a hierarchical root or an archive nested in another file
//! system, is identified by a [`MountPoint`] and served by one chain of
//! [`Controller`]s registered with a [`Manager`]. Changes to archives are
//! buffered until a sync commits them through the enclosing file system,
//! innermost archives first.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nestfs_core::testing::JsonArchiveDriver;
//! use nestfs_core::{
//!     ArchiveDetector, DriverRegistry, Federation, KernelConfig, Manager, MemoryStore,
//!     MountPoint, SyncOptions,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let drivers = DriverRegistry::with_defaults(Arc::new(MemoryStore::new()))
//!     .with_archive("zip", JsonArchiveDriver)?;
//! let manager = Arc::new(Manager::new(drivers, KernelConfig::default()));
//! let detector = ArchiveDetector::new().with("zip", "zip")?;
//! let federation = Federation::new(manager, MountPoint::new("mem:/")?, detector)?;
//!
//! federation.write_all("docs/archive.zip/readme.txt", b"hello")?;
//! federation.sync(SyncOptions::UMOUNT)?;
//! # Ok(())
//! # }
//! ```

pub mod addr;
pub mod archive;
pub mod config;
pub mod controller;
pub mod detector;
pub mod error;
pub mod federation;
pub mod lock;
pub mod manager;
pub mod pool;
pub mod resource;
pub mod storage;
pub mod sync;
pub mod testing;

pub use addr::{EntryName, MountPoint, NodePath, Scheme};
pub use archive::{ArchiveDriver, ArchiveFileSystem, Node, NodeType, Times};
pub use config::KernelConfig;
pub use controller::{AccessOptions, AccessTypes, Controller};
pub use detector::ArchiveDetector;
pub use error::FsError;
pub use federation::Federation;
pub use manager::{DriverRegistry, Manager};
pub use storage::MemoryStore;
pub use sync::{SyncError, SyncOptions};
