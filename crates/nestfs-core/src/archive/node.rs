use std::time::SystemTime;

/// Permissions of files synthesized without a template.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Permissions of directories synthesized without a template.
pub const DEFAULT_DIRECTORY_MODE: u32 = 0o755;

/// Kind of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    File,
    Directory,
}

impl NodeType {
    pub fn default_mode(self) -> u32 {
        match self {
            NodeType::File => DEFAULT_FILE_MODE,
            NodeType::Directory => DEFAULT_DIRECTORY_MODE,
        }
    }
}

/// Timestamps of a node. Absent components are unknown or unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Times {
    pub modified: Option<SystemTime>,
    pub accessed: Option<SystemTime>,
    pub created: Option<SystemTime>,
}

impl Times {
    /// All components set to the current time.
    pub fn now() -> Self {
        let now = SystemTime::now();
        Self {
            modified: Some(now),
            accessed: Some(now),
            created: Some(now),
        }
    }

    pub fn modified(at: SystemTime) -> Self {
        Self {
            modified: Some(at),
            ..Self::default()
        }
    }

    /// Replaces each component of `self` that is set in `update`.
    pub fn merge(&mut self, update: &Times) {
        if update.modified.is_some() {
            self.modified = update.modified;
        }
        if update.accessed.is_some() {
            self.accessed = update.accessed;
        }
        if update.created.is_some() {
            self.created = update.created;
        }
    }
}

/// A snapshot of the metadata of one node, as returned by `stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Base name of the node, empty for the root.
    pub name: String,
    pub node_type: NodeType,
    /// Content length in bytes, zero for directories.
    pub size: u64,
    pub times: Times,
    /// Unix permission bits.
    pub mode: u32,
    /// Base names of the children in insertion order, directories only.
    pub members: Option<Vec<String>>,
}

impl Node {
    pub fn is_file(&self) -> bool {
        self.node_type == NodeType::File
    }

    pub fn is_directory(&self) -> bool {
        self.node_type == NodeType::Directory
    }

    /// A template carrying only times and permissions.
    pub fn template(node_type: NodeType, times: Times) -> Self {
        Self {
            name: String::new(),
            node_type,
            size: 0,
            times,
            mode: node_type.default_mode(),
            members: None,
        }
    }
}
