//! Upper-layer classification.
//!
//! The upper layer mirrors the host root (`upperdir/usr/bin/x` is `/usr/bin/x`).
//! Each entry is reduced to an [`EntryKind`], the host path is reduced to an
//! [`Outside`] state, and [`classify_entry`] maps the pair to at most one
//! change. Rules, first match wins:
//!
//! | upper entry                         | host path            | change       |
//! |-------------------------------------|----------------------|--------------|
//! | symlink                             | any                  | symlink      |
//! | directory                           | absent               | dir created  |
//! | directory, opaque                   | present              | dir replaced |
//! | directory                           | present, not a dir   | dir replaced |
//! | character device 0:0, size 0        | any                  | deleted      |
//! | regular file, whiteout              | any                  | deleted      |
//! | regular file                        | present              | modified     |
//! | regular file                        | absent               | added        |
//!
//! A directory present on both sides that is not opaque yields nothing, even
//! when its mode or owner differ.

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, trace};
use walkdir::WalkDir;

use super::record::{ChangeKind, ChangeRecord};
use crate::error::WorkspaceError;
use crate::sandbox::host::HostOps;
use crate::workspace::{IgnoreFilter, join_under};

/// Type of an upper-layer entry, with the markers that matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Symlink,
    Directory { opaque: bool },
    CharDevice { rdev: u64, size: u64 },
    RegularFile { whiteout: bool },
    Other,
}

/// State of the corresponding host path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outside {
    /// Nothing there, not even a dangling symlink.
    Absent,
    /// A directory, or a symlink resolving to one.
    Directory,
    /// Anything else.
    NonDirectory,
}

impl Outside {
    #[must_use]
    pub fn of(path: &Path) -> Self {
        if fs::symlink_metadata(path).is_err() {
            Self::Absent
        } else if fs::metadata(path).is_ok_and(|m| m.is_dir()) {
            Self::Directory
        } else {
            Self::NonDirectory
        }
    }
}

/// An entry found in the upper layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpperEntry {
    /// Absolute host path the entry stands for.
    pub path: PathBuf,
    pub kind: EntryKind,
}

/// Maps an upper entry and the host state to a change.
#[must_use]
pub fn classify_entry(kind: EntryKind, outside: Outside) -> Option<ChangeKind> {
    match (kind, outside) {
        (EntryKind::Symlink, _) => Some(ChangeKind::Symlink),
        (EntryKind::Directory { .. }, Outside::Absent) => Some(ChangeKind::DirCreated),
        (EntryKind::Directory { opaque: true }, _) => Some(ChangeKind::DirReplaced),
        (EntryKind::Directory { .. }, Outside::NonDirectory) => Some(ChangeKind::DirReplaced),
        (EntryKind::Directory { .. }, Outside::Directory) => None,
        (EntryKind::CharDevice { rdev: 0, size: 0 }, _) => Some(ChangeKind::Deleted),
        (EntryKind::CharDevice { .. }, _) => None,
        (EntryKind::RegularFile { whiteout: true }, _) => Some(ChangeKind::Deleted),
        (EntryKind::RegularFile { .. }, Outside::Absent) => Some(ChangeKind::Added),
        (EntryKind::RegularFile { .. }, _) => Some(ChangeKind::Modified),
        (EntryKind::Other, _) => None,
    }
}

/// Walks an upper layer and produces the change list.
pub struct ChangeClassifier<'a, H: HostOps + ?Sized> {
    host: &'a H,
    upper_root: PathBuf,
    host_root: PathBuf,
    filter: &'a IgnoreFilter,
}

impl<'a, H: HostOps + ?Sized> ChangeClassifier<'a, H> {
    /// # Arguments
    ///
    /// * `host` - Answers overlay marker lookups
    /// * `upper_root` - The workspace's `upperdir/`
    /// * `host_root` - Root of the filesystem the upper layer shadows
    /// * `filter` - Paths to leave out
    #[must_use]
    pub fn new(
        host: &'a H,
        upper_root: impl Into<PathBuf>,
        host_root: impl Into<PathBuf>,
        filter: &'a IgnoreFilter,
    ) -> Self {
        Self {
            host,
            upper_root: upper_root.into(),
            host_root: host_root.into(),
            filter,
        }
    }

    /// Lists the upper layer's entries in sorted pre-order.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::IoError` if the upper layer cannot be walked.
    pub fn entries(&self) -> Result<Vec<UpperEntry>, WorkspaceError> {
        let mut entries = Vec::new();

        for entry in WalkDir::new(&self.upper_root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| WorkspaceError::IoError {
                context: format!("failed to scan upper layer: {}", self.upper_root.display()),
                source: e.into(),
            })?;

            let Ok(relative) = entry.path().strip_prefix(&self.upper_root) else {
                continue;
            };
            entries.push(UpperEntry {
                path: Path::new("/").join(relative),
                kind: self.inspect(entry.path())?,
            });
        }

        Ok(entries)
    }

    /// Classifies every entry not matched by the ignore filter.
    ///
    /// Classifying an unchanged upper layer twice yields the same list.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::IoError` if the upper layer cannot be walked.
    #[instrument(skip_all, fields(upper = %self.upper_root.display()))]
    pub fn classify(&self) -> Result<Vec<ChangeRecord>, WorkspaceError> {
        let mut records = Vec::new();

        for entry in self.entries()? {
            if self.filter.is_ignored(&entry.path.to_string_lossy()) {
                trace!(path = %entry.path.display(), "Ignored");
                continue;
            }

            let outside = Outside::of(&join_under(&self.host_root, &entry.path));
            if let Some(kind) = classify_entry(entry.kind, outside) {
                records.push(ChangeRecord::new(kind, entry.path));
            }
        }

        debug!(count = records.len(), "Upper layer classified");
        Ok(records)
    }

    fn inspect(&self, path: &Path) -> Result<EntryKind, WorkspaceError> {
        let meta = fs::symlink_metadata(path).map_err(|e| WorkspaceError::IoError {
            context: format!("failed to stat {}", path.display()),
            source: e,
        })?;
        let file_type = meta.file_type();

        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory {
                opaque: self.host.is_opaque(path),
            }
        } else if file_type.is_char_device() {
            EntryKind::CharDevice {
                rdev: meta.rdev(),
                size: meta.size(),
            }
        } else if file_type.is_file() {
            EntryKind::RegularFile {
                whiteout: self.host.is_whiteout(path),
            }
        } else {
            EntryKind::Other
        };
        Ok(kind)
    }
}
