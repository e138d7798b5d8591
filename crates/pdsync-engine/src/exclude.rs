//! Glob-based path exclusion
//!
//! Patterns from `exclude_patterns` are matched against both the path
//! relative to its sync root and the entry's base name, so `*.tmp` skips
//! temp files anywhere while `build/**` skips one subtree.

use std::path::Path;

use glob::{MatchOptions, Pattern};

/// A compiled set of exclusion globs.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<Pattern>,
}

impl ExcludeSet {
    /// Compile a pattern list. Invalid globs are rejected by config
    /// validation before this is reached.
    pub fn new(patterns: &[String]) -> Result<Self, glob::PatternError> {
        let patterns = patterns
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Whether `relative` (a path under its sync root) is excluded.
    #[must_use]
    pub fn is_excluded(&self, relative: &Path) -> bool {
        if self.patterns.is_empty() {
            return false;
        }

        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::default()
        };

        let rel_str = relative.to_string_lossy();
        let base = relative
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();

        self.patterns.iter().any(|p| {
            p.matches_with(&rel_str, options) || p.matches_with(&base, options)
        })
    }

    /// Whether the set contains no patterns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
