//! Recognition of archive files by name.

use crate::addr::{AddressError, Scheme};

/// Maps file name suffixes to archive schemes.
///
/// Suffixes are matched case-insensitively and may span several dots
/// (`.tar.gz`). When more than one suffix matches, the longest wins. A name
/// consisting of the suffix alone is not detected.
#[derive(Debug, Clone, Default)]
pub struct ArchiveDetector {
    /// Lower case suffixes with their leading dot, longest first.
    suffixes: Vec<(String, Scheme)>,
}

impl ArchiveDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a suffix, given with or without its leading dot.
    pub fn with(mut self, suffix: &str, scheme: &str) -> Result<Self, AddressError> {
        let scheme = Scheme::new(scheme)?;
        let suffix = format!(".{}", suffix.trim_start_matches('.').to_ascii_lowercase());
        self.suffixes.retain(|(existing, _)| *existing != suffix);
        self.suffixes.push((suffix, scheme));
        self.suffixes
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Ok(self)
    }

    /// A detector mapping `.<scheme>` to each scheme.
    pub fn for_schemes<'a>(
        schemes: impl IntoIterator<Item = &'a Scheme>,
    ) -> Result<Self, AddressError> {
        schemes
            .into_iter()
            .try_fold(Self::new(), |detector, scheme| {
                detector.with(scheme.as_str(), scheme.as_str())
            })
    }

    /// The archive scheme of a file named `name`, if any.
    pub fn detect(&self, name: &str) -> Option<&Scheme> {
        let lower = name.to_ascii_lowercase();
        self.suffixes
            .iter()
            .find(|(suffix, _)| lower.len() > suffix.len() && lower.ends_with(suffix.as_str()))
            .map(|(_, scheme)| scheme)
    }

    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }
}
