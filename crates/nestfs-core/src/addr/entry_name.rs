//! Normalized relative entry names.

use std::fmt;

use relative_path::{Component, RelativePath};

use super::{AddressError, MOUNT_POINT_SEPARATOR, paths};

/// A normalized, relative path inside one file system.
///
/// The empty name designates the root of the file system (the mount point
/// itself). Normalized names never contain `.` or `..` segments, empty
/// segments, or leading and trailing separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EntryName(String);

impl EntryName {
    /// Parses and normalizes `path`.
    ///
    /// A leading separator is accepted and dropped. `..` segments pop the
    /// previous segment and fail with [`AddressError::EscapesRoot`] when there
    /// is nothing left to pop.
    pub fn new(path: &str) -> Result<Self, AddressError> {
        if path.contains(MOUNT_POINT_SEPARATOR) {
            return Err(AddressError::ReservedSequence {
                path: path.to_string(),
            });
        }
        let relative = RelativePath::new(path.trim_start_matches(paths::SEPARATOR));
        let mut segments: Vec<&str> = Vec::new();
        for component in relative.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    if segments.pop().is_none() {
                        return Err(AddressError::EscapesRoot {
                            path: path.to_string(),
                        });
                    }
                }
                Component::Normal(segment) => segments.push(segment),
            }
        }
        Ok(Self(segments.join("/")))
    }

    /// The root entry name (empty).
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Whether this is the root entry name.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name of the parent directory, or `None` for the root.
    pub fn parent(&self) -> Option<EntryName> {
        if self.is_root() {
            return None;
        }
        Some(match self.0.rfind(paths::SEPARATOR) {
            Some(i) => Self(self.0[..i].to_string()),
            None => Self::root(),
        })
    }

    /// The last segment of this name, empty for the root.
    pub fn base_name(&self) -> &str {
        paths::split(&self.0).base
    }

    /// Appends a single, already normalized segment or relative name.
    pub fn join(&self, child: &str) -> Result<EntryName, AddressError> {
        if self.is_root() {
            return EntryName::new(child);
        }
        EntryName::new(&paths::resolve(Some(&self.0), child))
    }

    /// Iterates over the segments of this name.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(paths::SEPARATOR).filter(|s| !s.is_empty())
    }

    /// Whether `self` equals `ancestor` or lies below it.
    pub fn starts_with(&self, ancestor: &EntryName) -> bool {
        ancestor.is_root()
            || self.0 == ancestor.0
            || (self.0.starts_with(&ancestor.0)
                && self.0.as_bytes().get(ancestor.0.len()) == Some(&b'/'))
    }

    /// All ancestors from the root down to, but excluding, `self`.
    pub fn ancestors(&self) -> Vec<EntryName> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(name) = current {
            current = name.parent();
            out.push(name);
        }
        out.reverse();
        out
    }
}

impl fmt::Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntryName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for EntryName {
    type Error = AddressError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        EntryName::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_dots_and_separators() {
        assert_eq!(EntryName::new("a/./b//c/").unwrap().as_str(), "a/b/c");
        assert_eq!(EntryName::new("/a/b/../c").unwrap().as_str(), "a/c");
        assert_eq!(EntryName::new("").unwrap(), EntryName::root());
        assert_eq!(EntryName::new("/").unwrap(), EntryName::root());
        assert_eq!(EntryName::new("a/..").unwrap(), EntryName::root());
    }

    #[test]
    fn test_escaping_root_fails() {
        assert!(matches!(
            EntryName::new("../a"),
            Err(AddressError::EscapesRoot { .. })
        ));
        assert!(matches!(
            EntryName::new("a/../../b"),
            Err(AddressError::EscapesRoot { .. })
        ));
    }

    #[test]
    fn test_reserved_separator_rejected() {
        assert!(matches!(
            EntryName::new("a.zip!/b"),
            Err(AddressError::ReservedSequence { .. })
        ));
    }

    #[test]
    fn test_parent_and_base_name() {
        let name = EntryName::new("a/b/c.txt").unwrap();
        assert_eq!(name.base_name(), "c.txt");
        assert_eq!(name.parent().unwrap().as_str(), "a/b");
        assert_eq!(
            EntryName::new("a").unwrap().parent(),
            Some(EntryName::root())
        );
        assert_eq!(EntryName::root().parent(), None);
    }

    #[test]
    fn test_ancestors_are_root_first() {
        let name = EntryName::new("a/b/c").unwrap();
        let ancestors: Vec<String> = name.ancestors().iter().map(ToString::to_string).collect();
        assert_eq!(ancestors, vec!["", "a", "a/b"]);
    }

    #[test]
    fn test_starts_with_respects_segments() {
        let ab = EntryName::new("a/b").unwrap();
        assert!(ab.starts_with(&EntryName::new("a").unwrap()));
        assert!(ab.starts_with(&EntryName::root()));
        assert!(!EntryName::new("ab").unwrap().starts_with(&EntryName::new("a").unwrap()));
    }
}
