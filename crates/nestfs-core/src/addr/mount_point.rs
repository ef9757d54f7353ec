//! Absolute mount point identifiers.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use url::Url;

use super::{AddressError, EntryName, MOUNT_POINT_SEPARATOR, NodePath, Scheme, paths};

/// Absolute identifier of one file system instance in the federation.
///
/// A mount point is either a hierarchical root (`file:/home/amy/`, `mem:/`)
/// or an archive nested in a parent file system
/// (`zip:file:/home/amy/a.zip!/`). Its URI is always normalized and always
/// ends in a separator, so equality of URIs is equality of mount points.
///
/// Cloning is cheap: the parsed representation is shared.
#[derive(Clone)]
pub struct MountPoint {
    inner: Arc<Inner>,
}

struct Inner {
    uri: String,
    scheme: Scheme,
    /// Address of the archive file in the parent file system.
    parent: Option<NodePath>,
    /// Normalized path of a hierarchical root, `/` or `/a/b/`.
    path: Option<String>,
}

impl MountPoint {
    /// Parses and normalizes a mount point URI.
    ///
    /// Fails with [`AddressError::InvalidUri`] if the URI is not absolute, not
    /// hierarchical, does not end in a separator, or nests an address that
    /// does not name a node.
    pub fn new(uri: &str) -> Result<Self, AddressError> {
        let (scheme, rest) = uri
            .split_once(':')
            .ok_or_else(|| AddressError::invalid_uri(uri, "missing scheme"))?;
        let scheme = Scheme::new(scheme)?;

        if let Some(inner) = rest.strip_suffix(MOUNT_POINT_SEPARATOR) {
            let parent = NodePath::new(inner)?;
            if parent.entry_name().is_root() {
                return Err(AddressError::invalid_uri(
                    uri,
                    "an archive must be a node inside its parent file system",
                ));
            }
            return Ok(Self::nested(scheme, parent));
        }

        if rest.contains(MOUNT_POINT_SEPARATOR) {
            return Err(AddressError::invalid_uri(uri, "missing trailing '!/'"));
        }
        if !rest.ends_with(paths::SEPARATOR) {
            return Err(AddressError::invalid_uri(uri, "must end with '/'"));
        }
        let url = Url::parse(uri).map_err(|e| AddressError::invalid_uri(uri, e.to_string()))?;
        if url.cannot_be_a_base() {
            return Err(AddressError::invalid_uri(uri, "not hierarchical"));
        }

        let (authority, raw_path) = match rest.strip_prefix("//") {
            Some(after) => {
                let end = after.find(paths::SEPARATOR).unwrap_or(after.len());
                (&after[..end], &after[end..])
            }
            None => ("", rest),
        };
        if !raw_path.starts_with(paths::SEPARATOR) {
            return Err(AddressError::invalid_uri(uri, "not absolute"));
        }
        let normalized = EntryName::new(raw_path)?;
        let path = if normalized.is_root() {
            "/".to_string()
        } else {
            format!("/{normalized}/")
        };
        let uri = if authority.is_empty() {
            format!("{scheme}:{path}")
        } else {
            format!("{scheme}://{authority}{path}")
        };
        Ok(Self {
            inner: Arc::new(Inner {
                uri,
                scheme,
                parent: None,
                path: Some(path),
            }),
        })
    }

    /// Creates the mount point of an archive file addressed by `parent`.
    pub fn nested(scheme: Scheme, parent: NodePath) -> Self {
        let uri = format!("{scheme}:{parent}{MOUNT_POINT_SEPARATOR}");
        Self {
            inner: Arc::new(Inner {
                uri,
                scheme,
                parent: Some(parent),
                path: None,
            }),
        }
    }

    /// Returns the hierarchical root below this one for a child directory.
    ///
    /// Only hierarchical roots have child roots; archives return `None`.
    pub fn child_root(&self, segment: &str) -> Result<Option<MountPoint>, AddressError> {
        if self.inner.path.is_none() {
            return Ok(None);
        }
        let segment = EntryName::new(segment)?;
        if segment.is_root() {
            return Ok(Some(self.clone()));
        }
        MountPoint::new(&format!("{}{segment}/", self.inner.uri)).map(Some)
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    pub fn scheme(&self) -> &Scheme {
        &self.inner.scheme
    }

    /// Address of the archive file this mount point was mounted from.
    pub fn parent_path(&self) -> Option<&NodePath> {
        self.inner.parent.as_ref()
    }

    /// Mount point of the enclosing file system, `None` for a root.
    pub fn parent(&self) -> Option<&MountPoint> {
        self.inner.parent.as_ref().map(NodePath::mount_point)
    }

    /// Whether this is a hierarchical root rather than an archive.
    pub fn is_root(&self) -> bool {
        self.inner.parent.is_none()
    }

    /// Normalized path of a hierarchical root, e.g. `/` or `/a/b/`.
    pub fn hierarchical_path(&self) -> Option<&str> {
        self.inner.path.as_deref()
    }

    /// Number of archive boundaries between this mount point and its root.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent();
        while let Some(mp) = current {
            depth += 1;
            current = mp.parent();
        }
        depth
    }

    /// Resolves an entry name against this mount point.
    pub fn resolve(&self, entry_name: &EntryName) -> NodePath {
        NodePath::from_parts(self.clone(), entry_name.clone())
    }

    /// Whether this mount point equals `ancestor` or lies below it.
    ///
    /// Archive mount points lie below their parent file systems, hierarchical
    /// roots below the roots whose URI they extend.
    pub fn is_within(&self, ancestor: &MountPoint) -> bool {
        let mut current = self;
        loop {
            if current == ancestor {
                return true;
            }
            match current.parent() {
                Some(parent) => current = parent,
                None => {
                    return ancestor.is_root() && current.uri().starts_with(ancestor.uri());
                }
            }
        }
    }
}

impl PartialEq for MountPoint {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.uri == other.inner.uri
    }
}

impl Eq for MountPoint {}

impl Hash for MountPoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.uri.hash(state);
    }
}

impl PartialOrd for MountPoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MountPoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.inner.uri.cmp(&other.inner.uri)
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.uri)
    }
}

impl fmt::Debug for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MountPoint").field(&self.inner.uri).finish()
    }
}

impl FromStr for MountPoint {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MountPoint::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_mount_points_are_normalized() {
        assert_eq!(MountPoint::new("mem:/").unwrap().uri(), "mem:/");
        assert_eq!(MountPoint::new("MEM:/a//b/./").unwrap().uri(), "mem:/a/b/");
        assert_eq!(MountPoint::new("file:///tmp/").unwrap().uri(), "file:/tmp/");
        assert_eq!(
            MountPoint::new("http://example.com/a/").unwrap().uri(),
            "http://example.com/a/"
        );
    }

    #[test]
    fn test_invalid_mount_points() {
        for bad in ["mem", "mem:/a", "mem:a/", "zip:mem:/!/", "mem:/../", "zip:mem:/a.zip!/b"] {
            assert!(MountPoint::new(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_nested_mount_point() {
        let mp = MountPoint::new("jar:zip:file:/a.zip!/inner.jar!/").unwrap();
        assert_eq!(mp.scheme().as_str(), "jar");
        assert_eq!(mp.depth(), 2);

        let parent = mp.parent().unwrap();
        assert_eq!(parent.uri(), "zip:file:/a.zip!/");
        assert_eq!(mp.parent_path().unwrap().entry_name().as_str(), "inner.jar");
        assert_eq!(parent.parent().unwrap().uri(), "file:/");
        assert!(parent.parent().unwrap().is_root());
    }

    #[test]
    fn test_is_within() {
        let root = MountPoint::new("file:/").unwrap();
        let sub = MountPoint::new("file:/a/").unwrap();
        let zip = MountPoint::new("zip:file:/a/b.zip!/").unwrap();
        let other = MountPoint::new("mem:/").unwrap();

        assert!(zip.is_within(&zip));
        assert!(zip.is_within(&sub));
        assert!(zip.is_within(&root));
        assert!(sub.is_within(&root));
        assert!(!root.is_within(&sub));
        assert!(!zip.is_within(&other));
    }

    #[test]
    fn test_child_root() {
        let root = MountPoint::new("mem:/").unwrap();
        let child = root.child_root("a").unwrap().unwrap();
        assert_eq!(child.uri(), "mem:/a/");
        assert_eq!(child.hierarchical_path(), Some("/a/"));

        let zip = MountPoint::new("zip:mem:/a.zip!/").unwrap();
        assert!(zip.child_root("b").unwrap().is_none());
    }
}
