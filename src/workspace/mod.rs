//! Sandbox workspaces.
//!
//! A workspace is the directory tree that owns everything a run writes: the
//! overlay upper and work layers, the merged root the command runs in, and the
//! bookkeeping files that let `summary` and `commit` operate on it later.
//!
//! # Lifecycle
//!
//! - `Workspace::acquire(None, ..)` creates a fresh, empty workspace that is
//!   deleted on release unless it is marked as kept.
//! - `Workspace::acquire(Some(dir), ..)` reuses an existing directory. It must
//!   exist and pass the validity check; it is never deleted on release.
//! - `Workspace::open(dir)` opens an existing workspace for inspection.
//!
//! Release happens exactly once: explicitly through `release`, or when the
//! `Workspace` is dropped on an error path or during unwinding.
//!
//! # Validity
//!
//! A workspace is valid iff its merged root contains only directories. The
//! mount targets a run creates there (device nodes, fd symlinks, top-level
//! symlinks) are removed on teardown, so a leftover entry signals an unclean
//! or concurrent use.

pub mod ignore;
mod storage;

pub use ignore::IgnoreFilter;
pub use storage::{WorkspacePaths, join_under, remove_tree};

use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};

use crate::error::{Error, InputError, WorkspaceError};

/// A workspace acquired for one invocation.
#[derive(Debug)]
pub struct Workspace {
    paths: WorkspacePaths,
    persistent: bool,
    released: bool,
}

impl Workspace {
    /// Acquires a workspace for a run.
    ///
    /// # Arguments
    ///
    /// * `explicit` - Existing workspace to reuse (`-D`), if any
    /// * `scratch_dir` - Parent directory for fresh workspaces
    /// * `exec_id` - Execution identifier naming a fresh workspace
    ///
    /// # Errors
    ///
    /// - `InputError::WorkspaceNotFound` if `explicit` does not exist
    /// - `WorkspaceError::Invalid` if `explicit` fails the validity check
    /// - `WorkspaceError::AlreadyExists` if the fresh path is taken
    /// - `WorkspaceError::IoError` if directories cannot be created
    #[instrument(skip_all, fields(explicit = ?explicit, exec_id = %exec_id))]
    pub fn acquire(
        explicit: Option<&Path>,
        scratch_dir: &Path,
        exec_id: &str,
    ) -> Result<Self, Error> {
        let workspace = match explicit {
            Some(dir) => {
                let paths = Self::existing_paths(dir)?;
                paths.validate()?;
                paths.create_directories()?;
                debug!(root = %paths.root.display(), "Reusing workspace");
                Self {
                    paths,
                    persistent: true,
                    released: false,
                }
            }
            None => {
                let root = scratch_dir.join(format!("cowrun-{exec_id}"));
                if root.exists() {
                    return Err(WorkspaceError::AlreadyExists { path: root }.into());
                }
                let paths = WorkspacePaths::new(root);
                paths.create_directories()?;
                debug!(root = %paths.root.display(), "Created fresh workspace");
                Self {
                    paths,
                    persistent: false,
                    released: false,
                }
            }
        };

        Ok(workspace)
    }

    /// Opens an existing workspace for `summary`/`commit`.
    ///
    /// # Errors
    ///
    /// Same as `acquire` for an explicit path, plus
    /// `WorkspaceError::MissingDirectory` if it has no upper layer.
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub fn open(dir: &Path) -> Result<Self, Error> {
        let paths = Self::existing_paths(dir)?;
        paths.validate()?;
        paths.require_upper()?;
        Ok(Self {
            paths,
            persistent: true,
            released: false,
        })
    }

    fn existing_paths(dir: &Path) -> Result<WorkspacePaths, InputError> {
        if !dir.is_dir() {
            return Err(InputError::WorkspaceNotFound {
                path: dir.to_path_buf(),
            });
        }
        let root = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        Ok(WorkspacePaths::new(root))
    }

    /// Returns the workspace paths.
    #[must_use]
    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }

    /// Returns the workspace root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    /// Returns true if the workspace survives `release`.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Keeps the workspace on release (quiet and show modes).
    pub fn keep(&mut self) {
        self.persistent = true;
    }

    /// Persists ignore patterns given for this run.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::IoError` if the ignore file cannot be written.
    pub fn record_ignore_patterns(&self, patterns: &[String]) -> Result<(), WorkspaceError> {
        if patterns.is_empty() {
            return Ok(());
        }
        ignore::append_patterns(&self.paths.ignore_file, patterns).map_err(|e| {
            WorkspaceError::IoError {
                context: format!(
                    "failed to write ignore file: {}",
                    self.paths.ignore_file.display()
                ),
                source: e,
            }
        })
    }

    /// Builds the ignore filter from the persisted patterns plus `extra`.
    ///
    /// # Errors
    ///
    /// Returns an input error for an invalid pattern, or a workspace error if
    /// the ignore file is unreadable.
    pub fn ignore_filter(&self, extra: &[String]) -> Result<IgnoreFilter, Error> {
        let mut patterns = ignore::load_patterns(&self.paths.ignore_file).map_err(|e| {
            WorkspaceError::IoError {
                context: format!(
                    "failed to read ignore file: {}",
                    self.paths.ignore_file.display()
                ),
                source: e,
            }
        })?;
        for pattern in extra {
            if !patterns.contains(pattern) {
                patterns.push(pattern.clone());
            }
        }
        Ok(IgnoreFilter::new(patterns)?)
    }

    /// Releases the workspace, deleting it unless persistent.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::IoError` if deletion fails.
    #[instrument(skip_all, fields(root = %self.paths.root.display(), persistent = self.persistent))]
    pub fn release(mut self) -> Result<Option<PathBuf>, WorkspaceError> {
        self.release_once()
    }

    fn release_once(&mut self) -> Result<Option<PathBuf>, WorkspaceError> {
        if self.released {
            return Ok(None);
        }
        self.released = true;

        if self.persistent {
            debug!("Keeping workspace");
            return Ok(Some(self.paths.root.clone()));
        }

        if let Err(e) = self.paths.cleanup() {
            warn!(error = %e, "Failed to remove workspace");
            return Err(e);
        }
        debug!("Workspace removed");
        Ok(None)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // Errors were already logged by release_once.
        let _ = self.release_once();
    }
}
