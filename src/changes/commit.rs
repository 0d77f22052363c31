//! Applying a change list to the host, and rendering it for review.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, trace, warn};

use super::record::{ChangeKind, ChangeRecord};
use crate::workspace::{IgnoreFilter, join_under};

/// Header of a non-empty summary.
pub const SUMMARY_HEADER: &str = "Changes detected in the following files:";

/// Printed instead of a summary when nothing changed.
pub const NO_CHANGES: &str = "No changes detected";

/// A record that could not be applied.
#[derive(Debug)]
pub struct CommitFailure {
    pub record: ChangeRecord,
    pub error: io::Error,
}

/// Outcome of a commit.
#[derive(Debug, Default)]
pub struct CommitReport {
    /// Records applied successfully.
    pub applied: usize,
    pub failures: Vec<CommitFailure>,
}

impl CommitReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Applies change records from an upper layer onto the host.
pub struct CommitEngine<'a> {
    upper_root: PathBuf,
    host_root: PathBuf,
    filter: &'a IgnoreFilter,
}

impl<'a> CommitEngine<'a> {
    #[must_use]
    pub fn new(
        upper_root: impl Into<PathBuf>,
        host_root: impl Into<PathBuf>,
        filter: &'a IgnoreFilter,
    ) -> Self {
        Self {
            upper_root: upper_root.into(),
            host_root: host_root.into(),
            filter,
        }
    }

    /// Applies `records` in order.
    ///
    /// Not transactional: a failing record is reported and the remaining
    /// records are still attempted.
    #[instrument(skip_all, fields(count = records.len()))]
    pub fn commit(&self, records: &[ChangeRecord]) -> CommitReport {
        let mut report = CommitReport::default();

        for record in records {
            if self.filter.is_ignored(&record.path.to_string_lossy()) {
                trace!(path = %record.path.display(), "Ignored");
                continue;
            }

            match self.apply(record) {
                Ok(()) => report.applied += 1,
                Err(error) => {
                    warn!(change = %record, error = %error, "Failed to apply change");
                    report.failures.push(CommitFailure {
                        record: record.clone(),
                        error,
                    });
                }
            }
        }

        debug!(
            applied = report.applied,
            failed = report.failures.len(),
            "Commit finished"
        );
        report
    }

    fn apply(&self, record: &ChangeRecord) -> io::Result<()> {
        let upper = join_under(&self.upper_root, &record.path);
        let host = join_under(&self.host_root, &record.path);
        trace!(change = %record, "Applying");

        match record.kind {
            ChangeKind::Symlink => {
                let target = fs::read_link(&upper)?;
                remove_path(&host)?;
                symlink(target, &host)
            }
            ChangeKind::DirReplaced => {
                remove_path(&host)?;
                create_dir_like(&upper, &host)
            }
            ChangeKind::DirCreated => create_dir_like(&upper, &host),
            ChangeKind::Deleted => remove_path(&host),
            ChangeKind::Modified => {
                remove_path(&host)?;
                move_into_place(&upper, &host)
            }
            ChangeKind::Added => move_into_place(&upper, &host),
        }
    }
}

/// Renders the review summary.
#[must_use]
pub fn summarize(records: &[ChangeRecord]) -> String {
    if records.is_empty() {
        return format!("{NO_CHANGES}\n");
    }

    let mut out = format!("{SUMMARY_HEADER}\n\n");
    for record in records {
        let _ = writeln!(out, "{} ({})", record.path.display(), record.kind.description());
    }
    out
}

/// Removes `path` whatever it is. A missing path is not an error.
fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Creates `dest` with the permissions of the upper directory, if readable.
fn create_dir_like(upper: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir(dest)?;
    if let Ok(meta) = fs::metadata(upper) {
        fs::set_permissions(dest, meta.permissions())?;
    }
    Ok(())
}

/// Renames `from` to `to`, copying across filesystems.
fn move_into_place(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            trace!(from = %from.display(), "Cross-device move, copying");
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
        Err(e) => Err(e),
    }
}
