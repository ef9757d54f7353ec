use std::fmt;
use std::str::FromStr;

use super::AddressError;

/// The driver selector of a mount point, e.g. `file`, `mem` or `zip`.
///
/// Schemes follow RFC 3986 syntax and are compared case-insensitively, so
/// they are stored in lower case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scheme(String);

impl Scheme {
    pub fn new(scheme: &str) -> Result<Self, AddressError> {
        let mut chars = scheme.chars();
        let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
            && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !valid {
            return Err(AddressError::InvalidScheme(scheme.to_string()));
        }
        Ok(Self(scheme.to_ascii_lowercase()))
    }

    /// A scheme known to be valid and lower case.
    pub(crate) fn from_static(scheme: &'static str) -> Self {
        debug_assert!(Scheme::new(scheme).is_ok_and(|s| s.0 == scheme));
        Self(scheme.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Scheme {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scheme::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_is_lowercased() {
        assert_eq!(Scheme::new("ZIP").unwrap().as_str(), "zip");
        assert_eq!(Scheme::new("tar.gz").unwrap().as_str(), "tar.gz");
    }

    #[test]
    fn test_invalid_schemes() {
        for bad in ["", "1zip", "zi p", "zip:"] {
            assert!(Scheme::new(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}
