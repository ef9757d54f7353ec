//! Root file systems that archives can be stored in.
//!
//! - `mem:` is served by [`MemoryDriver`] over a shared [`MemoryStore`]
//! - `file:` is served by [`LocalDriver`] over the local file system

mod local;
mod memory;

pub use local::{LocalController, LocalDriver};
pub use memory::{MemoryController, MemoryDriver, MemoryStore};

use std::fmt::Debug;

use crate::controller::{Controller, ControllerModel};
use crate::error::FsError;

/// Factory of controllers for hierarchical root mount points.
pub trait StorageDriver: Send + Sync + Debug {
    fn new_controller(&self, model: ControllerModel) -> Result<Box<dyn Controller>, FsError>;
}
