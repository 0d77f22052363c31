//! Path ignore patterns.
//!
//! Patterns are extended regular expressions matched anywhere in the absolute
//! host path of a changed entry, so `\.log$` hides every log file and
//! `^/var/cache/` hides a whole subtree.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use regex::{Regex, RegexSet};

use crate::error::InputError;

/// A compiled set of ignore patterns.
#[derive(Debug, Clone)]
pub struct IgnoreFilter {
    patterns: Vec<String>,
    set: RegexSet,
}

impl IgnoreFilter {
    /// Compiles the given patterns.
    ///
    /// # Errors
    ///
    /// Returns `InputError::InvalidIgnorePattern` naming the first pattern
    /// that is not a valid regular expression.
    pub fn new<I, S>(patterns: I) -> Result<Self, InputError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(Into::into)
            .filter(|p| !p.is_empty())
            .collect();

        for pattern in &patterns {
            Regex::new(pattern).map_err(|source| InputError::InvalidIgnorePattern {
                pattern: pattern.clone(),
                source,
            })?;
        }

        let set = RegexSet::new(&patterns).map_err(|source| InputError::InvalidIgnorePattern {
            pattern: patterns.join("|"),
            source,
        })?;

        Ok(Self { patterns, set })
    }

    /// A filter that ignores nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            set: RegexSet::empty(),
        }
    }

    /// Returns true if `path` matches any pattern.
    #[must_use]
    pub fn is_ignored(&self, path: &str) -> bool {
        self.set.is_match(path)
    }

    /// The source patterns, in insertion order.
    #[must_use]
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl Default for IgnoreFilter {
    fn default() -> Self {
        Self::empty()
    }
}

/// Reads a pattern file, one pattern per line. A missing file holds no patterns.
pub fn load_patterns(path: &Path) -> io::Result<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Appends patterns that the file does not hold yet.
pub fn append_patterns(path: &Path, patterns: &[String]) -> io::Result<()> {
    let existing = load_patterns(path)?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    for pattern in patterns {
        if !pattern.is_empty() && !existing.contains(pattern) {
            writeln!(file, "{pattern}")?;
        }
    }
    Ok(())
}
