//! Change records and their line format.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::WorkspaceError;

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Symlink,
    DirReplaced,
    DirCreated,
    Deleted,
    Modified,
    Added,
}

impl ChangeKind {
    pub const ALL: [Self; 6] = [
        Self::Symlink,
        Self::DirReplaced,
        Self::DirCreated,
        Self::Deleted,
        Self::Modified,
        Self::Added,
    ];

    /// Two-letter code used in the change file.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Symlink => "ln",
            Self::DirReplaced => "rd",
            Self::DirCreated => "md",
            Self::Deleted => "de",
            Self::Modified => "mo",
            Self::Added => "ad",
        }
    }

    /// Description used in summaries.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Symlink => "symlink",
            Self::DirReplaced => "replaced with dir",
            Self::DirCreated => "created dir",
            Self::Deleted => "deleted",
            Self::Modified => "modified",
            Self::Added => "added",
        }
    }

    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

/// One classified change, addressed by its absolute host path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

impl ChangeRecord {
    #[must_use]
    pub fn new(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

impl fmt::Display for ChangeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.code(), self.path.display())
    }
}

impl FromStr for ChangeRecord {
    type Err = WorkspaceError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let malformed = || WorkspaceError::MalformedChangeRecord {
            line: line.to_string(),
        };

        let (code, path) = line.split_once(' ').ok_or_else(malformed)?;
        let kind = ChangeKind::from_code(code).ok_or_else(malformed)?;
        if !path.starts_with('/') {
            return Err(malformed());
        }
        Ok(Self::new(kind, path))
    }
}

/// Writes records one per line, replacing the file.
///
/// # Errors
///
/// Returns `WorkspaceError::IoError` if the file cannot be written.
pub fn write_records(path: &Path, records: &[ChangeRecord]) -> Result<(), WorkspaceError> {
    let content: String = records.iter().map(|r| format!("{r}\n")).collect();
    fs::write(path, content).map_err(|e| WorkspaceError::IoError {
        context: format!("failed to write change list: {}", path.display()),
        source: e,
    })
}

/// Reads a change file. A missing file holds no records.
///
/// # Errors
///
/// Returns `WorkspaceError::MalformedChangeRecord` for an unparsable line.
pub fn read_records(path: &Path) -> Result<Vec<ChangeRecord>, WorkspaceError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(WorkspaceError::IoError {
                context: format!("failed to read change list: {}", path.display()),
                source: e,
            });
        }
    };

    content
        .lines()
        .filter(|l| !l.is_empty())
        .map(str::parse)
        .collect()
}
