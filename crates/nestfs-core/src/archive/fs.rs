//! Arena-backed virtual directory tree of one archive.
//!
//! Nodes live in a slot vector and are addressed by stable indices. An index
//! maps entry names to slots, and every directory keeps the ids of its
//! children in insertion order, so mutation costs O(path depth) and directory
//! enumeration is stable for deterministic archive rewrites.
//!
//! Every mutating operation validates completely before it changes anything:
//! a call either applies fully and marks the tree touched, or fails and leaves
//! the tree exactly as it was.

use std::collections::HashMap;

use thiserror::Error;
use tracing::trace;

use super::driver::{ArchiveEntry, DriverError};
use super::node::{Node, NodeType, Times};
use crate::addr::EntryName;
use crate::controller::AccessOptions;

type NodeId = usize;

const ROOT: NodeId = 0;

/// Errors from tree operations. The tree is unmodified when one is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("no such node: '{name}'")]
    NoSuchNode { name: EntryName },

    #[error("node exists: '{name}'")]
    NodeExists { name: EntryName },

    #[error("directory not empty: '{name}'")]
    DirectoryNotEmpty { name: EntryName },

    #[error("no such parent directory for '{name}'")]
    NoSuchParent { name: EntryName },

    #[error("cannot {operation} the root directory")]
    RootNode { operation: &'static str },
}

#[derive(Debug, Clone)]
struct Slot {
    name: EntryName,
    node_type: NodeType,
    size: u64,
    times: Times,
    mode: u32,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Slot {
    fn new(name: EntryName, node_type: NodeType, template: Option<&Node>) -> Self {
        let (times, mode) = match template {
            Some(t) => (t.times, t.mode),
            None => (Times::now(), node_type.default_mode()),
        };
        Self {
            name,
            node_type,
            size: 0,
            times,
            mode,
            parent: None,
            children: Vec::new(),
        }
    }
}

/// The mutable directory tree of one mounted archive.
#[derive(Debug, Clone)]
pub struct ArchiveFileSystem {
    slots: Vec<Option<Slot>>,
    free: Vec<NodeId>,
    index: HashMap<EntryName, NodeId>,
    touched: bool,
}

impl ArchiveFileSystem {
    /// Creates a tree containing only the root directory.
    pub fn empty() -> Self {
        let root = Slot::new(EntryName::root(), NodeType::Directory, None);
        let mut index = HashMap::new();
        index.insert(EntryName::root(), ROOT);
        Self {
            slots: vec![Some(root)],
            free: Vec::new(),
            index,
            touched: false,
        }
    }

    /// Builds the tree of an existing archive from its entries.
    ///
    /// Missing parent directories are synthesized with default permissions.
    /// A later entry with the name of an earlier one, synthesized or not,
    /// replaces its metadata. Entries that disagree on whether a name is a
    /// file or a directory make the archive undecodable. The result is not
    /// touched.
    pub fn populate<I>(entries: I) -> Result<Self, DriverError>
    where
        I: IntoIterator<Item = ArchiveEntry>,
    {
        let mut fs = Self::empty();
        for entry in entries {
            fs.add_entry(entry)?;
        }
        fs.touched = false;
        trace!(nodes = fs.len(), "populated archive file system");
        Ok(fs)
    }

    fn add_entry(&mut self, entry: ArchiveEntry) -> Result<(), DriverError> {
        let size = match entry.node_type {
            NodeType::File => entry.size,
            NodeType::Directory => 0,
        };
        if let Some(&id) = self.index.get(&entry.name) {
            let slot = self.slot_mut(id);
            if slot.node_type != entry.node_type {
                return Err(DriverError::Codec {
                    reason: format!(
                        "'{}' is stored both as a file and as a directory",
                        entry.name
                    ),
                });
            }
            slot.size = size;
            slot.times = entry.times;
            slot.mode = entry.mode;
            return Ok(());
        }

        let missing = self
            .plan_insert(&entry.name, AccessOptions::CREATE_PARENTS)
            .map_err(|e| DriverError::Codec {
                reason: format!("cannot place '{}': {e}", entry.name),
            })?;
        let mut slot = Slot::new(entry.name, entry.node_type, None);
        slot.size = size;
        slot.times = entry.times;
        slot.mode = entry.mode;
        self.apply_insert(missing, slot);
        Ok(())
    }

    /// Number of nodes including the root.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the tree contains only the root.
    pub fn is_empty(&self) -> bool {
        self.index.len() == 1
    }

    /// Whether the tree has been mutated since it was mounted.
    pub fn is_touched(&self) -> bool {
        self.touched
    }

    pub fn touch(&mut self) {
        self.touched = true;
    }

    pub fn stat(&self, name: &EntryName) -> Option<Node> {
        self.index.get(name).map(|&id| self.node(id))
    }

    /// Creates a node of the given type.
    ///
    /// An existing node of the same type is accepted unless `EXCLUSIVE` is
    /// set; an existing file is then truncated. Missing ancestors are
    /// created only with `CREATE_PARENTS`.
    pub fn mknod(
        &mut self,
        name: &EntryName,
        node_type: NodeType,
        template: Option<&Node>,
        options: AccessOptions,
    ) -> Result<(), TreeError> {
        let exclusive = options.contains(AccessOptions::EXCLUSIVE);
        if let Some(&id) = self.index.get(name) {
            let existing = self.slot(id).node_type;
            if exclusive || existing != node_type {
                return Err(TreeError::NodeExists { name: name.clone() });
            }
            if node_type == NodeType::File {
                let slot = self.slot_mut(id);
                slot.size = 0;
                match template {
                    Some(t) => slot.times.merge(&t.times),
                    None => slot.times.modified = Times::now().modified,
                }
                self.touched = true;
            }
            return Ok(());
        }

        let missing = self.plan_insert(name, options)?;
        self.apply_insert(missing, Slot::new(name.clone(), node_type, template));
        Ok(())
    }

    /// Removes a file or an empty directory.
    pub fn unlink(&mut self, name: &EntryName) -> Result<(), TreeError> {
        if name.is_root() {
            return Err(TreeError::RootNode {
                operation: "unlink",
            });
        }
        let id = *self
            .index
            .get(name)
            .ok_or_else(|| TreeError::NoSuchNode { name: name.clone() })?;
        if !self.slot(id).children.is_empty() {
            return Err(TreeError::DirectoryNotEmpty { name: name.clone() });
        }

        if let Some(parent) = self.slot(id).parent {
            self.slot_mut(parent).children.retain(|&child| child != id);
        }
        self.index.remove(name);
        self.slots[id] = None;
        self.free.push(id);
        self.touched = true;
        Ok(())
    }

    /// Duplicates the metadata of `existing` under `new_name`.
    ///
    /// Directories are linked without their members.
    pub fn link(
        &mut self,
        existing: &EntryName,
        new_name: &EntryName,
        options: AccessOptions,
    ) -> Result<(), TreeError> {
        let source = *self.index.get(existing).ok_or_else(|| TreeError::NoSuchNode {
            name: existing.clone(),
        })?;
        if self.index.contains_key(new_name) {
            return Err(TreeError::NodeExists {
                name: new_name.clone(),
            });
        }
        let missing = self.plan_insert(new_name, options)?;

        let source = self.slot(source);
        let mut slot = Slot::new(new_name.clone(), source.node_type, None);
        slot.size = source.size;
        slot.times = source.times;
        slot.mode = source.mode;
        self.apply_insert(missing, slot);
        Ok(())
    }

    /// Replaces the provided timestamp components of a node.
    pub fn set_times(&mut self, name: &EntryName, times: &Times) -> Result<(), TreeError> {
        let id = self.lookup(name)?;
        self.slot_mut(id).times.merge(times);
        self.touched = true;
        Ok(())
    }

    /// Records the content length of a file.
    pub fn set_size(&mut self, name: &EntryName, size: u64) -> Result<(), TreeError> {
        let id = self.lookup(name)?;
        self.slot_mut(id).size = size;
        self.touched = true;
        Ok(())
    }

    /// All nodes except the root in pre-order, children in insertion order.
    pub fn walk(&self) -> Vec<(EntryName, Node)> {
        let mut out = Vec::with_capacity(self.index.len().saturating_sub(1));
        let mut stack: Vec<NodeId> = self.slot(ROOT).children.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            let slot = self.slot(id);
            out.push((slot.name.clone(), self.node(id)));
            stack.extend(slot.children.iter().rev().copied());
        }
        out
    }

    /// Verifies the structural invariants of the tree.
    ///
    /// Every non-root node has a directory parent listing it, the tree is
    /// connected and acyclic, and the index agrees with the arena.
    pub fn check_invariants(&self) -> Result<(), String> {
        let live = self.slots.iter().filter(|s| s.is_some()).count();
        if live != self.index.len() {
            return Err(format!("{live} live slots but {} indexed", self.index.len()));
        }
        for (name, &id) in &self.index {
            let slot = self
                .slots
                .get(id)
                .and_then(Option::as_ref)
                .ok_or_else(|| format!("'{name}' indexes a free slot"))?;
            if &slot.name != name {
                return Err(format!("'{name}' indexes slot named '{}'", slot.name));
            }
            if id == ROOT {
                if slot.parent.is_some() || slot.node_type != NodeType::Directory {
                    return Err("root must be a parentless directory".to_string());
                }
                continue;
            }
            let parent = slot.parent.ok_or_else(|| format!("'{name}' has no parent"))?;
            let parent_slot = self.slot(parent);
            if parent_slot.node_type != NodeType::Directory {
                return Err(format!("parent of '{name}' is not a directory"));
            }
            if !parent_slot.children.contains(&id) {
                return Err(format!("parent of '{name}' does not list it"));
            }
            if Some(&parent_slot.name) != name.parent().as_ref() {
                return Err(format!("'{name}' is linked below '{}'", parent_slot.name));
            }
        }
        if self.walk().len() + 1 != self.index.len() {
            return Err("tree is not connected".to_string());
        }
        Ok(())
    }

    /// Checks where `name` would go and returns the ancestors to synthesize,
    /// root first. Does not mutate.
    fn plan_insert(
        &self,
        name: &EntryName,
        options: AccessOptions,
    ) -> Result<Vec<EntryName>, TreeError> {
        let mut missing = Vec::new();
        for ancestor in name.ancestors() {
            match self.index.get(&ancestor) {
                Some(&id) if self.slot(id).node_type == NodeType::File => {
                    return Err(TreeError::NodeExists { name: ancestor });
                }
                Some(_) => {}
                None if options.contains(AccessOptions::CREATE_PARENTS) => missing.push(ancestor),
                None => return Err(TreeError::NoSuchParent { name: name.clone() }),
            }
        }
        Ok(missing)
    }

    fn apply_insert(&mut self, missing: Vec<EntryName>, slot: Slot) {
        for ancestor in missing {
            self.insert(Slot::new(ancestor, NodeType::Directory, None));
        }
        self.insert(slot);
        self.touched = true;
    }

    fn insert(&mut self, mut slot: Slot) -> NodeId {
        let parent = slot
            .name
            .parent()
            .and_then(|p| self.index.get(&p).copied())
            .unwrap_or(ROOT);
        slot.parent = Some(parent);
        let name = slot.name.clone();
        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(slot);
                id
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.slot_mut(parent).children.push(id);
        self.index.insert(name, id);
        id
    }

    fn lookup(&self, name: &EntryName) -> Result<NodeId, TreeError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| TreeError::NoSuchNode { name: name.clone() })
    }

    fn node(&self, id: NodeId) -> Node {
        let slot = self.slot(id);
        let members = (slot.node_type == NodeType::Directory).then(|| {
            slot.children
                .iter()
                .map(|&child| self.slot(child).name.base_name().to_string())
                .collect()
        });
        Node {
            name: slot.name.base_name().to_string(),
            node_type: slot.node_type,
            size: slot.size,
            times: slot.times,
            mode: slot.mode,
            members,
        }
    }

    // Ids reachable from the index always point to live slots.
    fn slot(&self, id: NodeId) -> &Slot {
        match &self.slots[id] {
            Some(slot) => slot,
            None => unreachable!("node id {id} refers to a free slot"),
        }
    }

    fn slot_mut(&mut self, id: NodeId) -> &mut Slot {
        match &mut self.slots[id] {
            Some(slot) => slot,
            None => unreachable!("node id {id} refers to a free slot"),
        }
    }
}

impl Default for ArchiveFileSystem {
    fn default() -> Self {
        Self::empty()
    }
}
