use std::fmt;
use std::str::FromStr;

use super::{AddressError, EntryName, MOUNT_POINT_SEPARATOR, MountPoint, paths};

/// Fully qualified address of a node: a mount point plus an entry name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodePath {
    mount_point: MountPoint,
    entry_name: EntryName,
}

impl NodePath {
    /// Parses a node address.
    ///
    /// The address is split at its last `!/` if it has one, otherwise at its
    /// last separator, so `file:/a/b.zip` is entry `b.zip` of `file:/a/`.
    pub fn new(uri: &str) -> Result<Self, AddressError> {
        let (mount_point, entry) = match uri.rfind(MOUNT_POINT_SEPARATOR) {
            Some(i) => uri.split_at(i + MOUNT_POINT_SEPARATOR.len()),
            None => {
                let i = uri
                    .rfind(paths::SEPARATOR)
                    .ok_or_else(|| AddressError::invalid_uri(uri, "not hierarchical"))?;
                uri.split_at(i + 1)
            }
        };
        Ok(Self {
            mount_point: MountPoint::new(mount_point)?,
            entry_name: EntryName::new(entry)?,
        })
    }

    pub(crate) fn from_parts(mount_point: MountPoint, entry_name: EntryName) -> Self {
        Self {
            mount_point,
            entry_name,
        }
    }

    pub fn mount_point(&self) -> &MountPoint {
        &self.mount_point
    }

    pub fn entry_name(&self) -> &EntryName {
        &self.entry_name
    }

    pub fn into_parts(self) -> (MountPoint, EntryName) {
        (self.mount_point, self.entry_name)
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.mount_point, self.entry_name)
    }
}

impl FromStr for NodePath {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodePath::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_node() {
        let path = NodePath::new("zip:file:/a.zip!/inner/readme.txt").unwrap();
        assert_eq!(path.mount_point().uri(), "zip:file:/a.zip!/");
        assert_eq!(path.entry_name().as_str(), "inner/readme.txt");
    }

    #[test]
    fn test_parse_hierarchical_node() {
        let path = NodePath::new("file:/a/b.zip").unwrap();
        assert_eq!(path.mount_point().uri(), "file:/a/");
        assert_eq!(path.entry_name().as_str(), "b.zip");
    }

    #[test]
    fn test_resolve_then_split_round_trips() {
        let mp = MountPoint::new("zip:mem:/x.zip!/").unwrap();
        let name = EntryName::new("a/b").unwrap();
        let path = mp.resolve(&name);
        assert_eq!(path.to_string(), "zip:mem:/x.zip!/a/b");

        let reparsed = NodePath::new(&path.to_string()).unwrap();
        assert_eq!(reparsed, path);
        let (mp2, name2) = reparsed.into_parts();
        assert_eq!(mp2, mp);
        assert_eq!(name2, name);
    }
}
