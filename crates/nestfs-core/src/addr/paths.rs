//! Pure helpers for splitting and joining slash-separated paths.
//!
//! These functions never fail and never allocate unless they have to. They
//! underlie all tree navigation in [`ArchiveFileSystem`](crate::archive::ArchiveFileSystem)
//! and in the path facade.

/// The one and only separator of entry names and mount point paths.
pub const SEPARATOR: char = '/';

/// The parent part designating the root when a path has no directory part.
pub const ROOT: &str = "/";

/// Result of [`split`]: the parent directory name and the base name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split<'a> {
    /// Parent directory including its trailing separator, or `None` for the
    /// empty path.
    pub parent: Option<&'a str>,
    /// Last path segment without separators.
    pub base: &'a str,
}

/// Strips all trailing separators from `path`.
pub fn cut_trailing_separators(path: &str) -> &str {
    path.trim_end_matches(SEPARATOR)
}

/// Splits `path` into its parent directory name and its base name.
///
/// Trailing separators are redundant and ignored. A path without any
/// directory part has the root ("/") as its parent.
///
/// ```
/// use nestfs_core::addr::paths::split;
///
/// assert_eq!(split("a/b").parent, Some("a/"));
/// assert_eq!(split("a/b").base, "b");
/// assert_eq!(split("a").parent, Some("/"));
/// assert_eq!(split("").parent, None);
/// ```
pub fn split(path: &str) -> Split<'_> {
    let trimmed = cut_trailing_separators(path);
    if trimmed.is_empty() {
        return Split {
            parent: None,
            base: "",
        };
    }
    match trimmed.rfind(SEPARATOR) {
        Some(i) => Split {
            parent: Some(&trimmed[..=i]),
            base: &trimmed[i + 1..],
        },
        None => Split {
            parent: Some(ROOT),
            base: trimmed,
        },
    }
}

/// Joins a parent directory name and a base name.
///
/// This is the inverse of [`split`] modulo [`normalize`].
pub fn resolve(parent: Option<&str>, base: &str) -> String {
    match parent {
        None => base.to_string(),
        Some(p) if p.ends_with(SEPARATOR) => format!("{p}{base}"),
        Some(p) => format!("{p}{SEPARATOR}{base}"),
    }
}

/// Removes empty segments as well as leading and trailing separators.
///
/// Unlike [`EntryName::new`](crate::addr::EntryName::new) this does not
/// interpret `.` or `..`.
pub fn normalize(path: &str) -> String {
    path.split(SEPARATOR)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_split_table() {
        let table: &[(&str, Option<&str>, &str)] = &[
            ("", None, ""),
            ("/", None, ""),
            ("a", Some("/"), "a"),
            ("a/", Some("/"), "a"),
            ("/a", Some("/"), "a"),
            ("/a/", Some("/"), "a"),
            ("a/b", Some("a/"), "b"),
            ("a/b/", Some("a/"), "b"),
            ("/a/b", Some("/a/"), "b"),
            ("a/b/c", Some("a/b/"), "c"),
        ];
        for &(path, parent, base) in table {
            let split = split(path);
            assert_eq!(split.parent, parent, "parent of {path:?}");
            assert_eq!(split.base, base, "base of {path:?}");
        }
    }

    #[test]
    fn test_resolve_inserts_separator() {
        assert_eq!(resolve(Some("a"), "b"), "a/b");
        assert_eq!(resolve(Some("a/"), "b"), "a/b");
        assert_eq!(resolve(None, "b"), "b");
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/a//b/"), "a/b");
        assert_eq!(normalize("/"), "");
        assert_eq!(normalize(""), "");
    }

    proptest! {
        #[test]
        fn prop_split_then_resolve_is_identity(path in "[ab/]{0,12}") {
            let split = split(&path);
            let joined = resolve(split.parent, split.base);
            prop_assert_eq!(normalize(&joined), normalize(&path));
        }

        #[test]
        fn prop_base_has_no_separator(path in "[ab/]{0,12}") {
            prop_assert!(!split(&path).base.contains(SEPARATOR));
        }
    }
}
