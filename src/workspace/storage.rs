//! Filesystem layout for workspace storage.
//!
//! This module manages the directory structure of a workspace, including
//! creation, validation, and cleanup of the layer directories.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::WorkspaceError;

/// Directory permissions: owner read/write/execute only (0700).
const DIR_PERMISSIONS: u32 = 0o700;

/// Paths for a workspace's filesystem structure.
///
/// ```text
/// {root}/
/// ├── upperdir/      # OverlayFS upper layers, one subtree per mountpoint
/// ├── workdir/       # OverlayFS work directories
/// ├── temproot/      # Merged root the command runs in
/// ├── unionroot/     # Flattened union-helper views for nested mounts
/// ├── ignore         # Persisted ignore patterns
/// ├── mount.log      # Degraded and failed mount attempts
/// ├── request.json   # Last execution request
/// └── changes        # Last classified change list
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    /// Root directory of the workspace.
    pub root: PathBuf,
    /// OverlayFS upper layers (writable).
    pub upper: PathBuf,
    /// OverlayFS work directories (internal kernel use).
    pub work: PathBuf,
    /// Merged root filesystem.
    pub merged: PathBuf,
    /// Mount targets for union-helper views.
    pub union_root: PathBuf,
    /// Ignore pattern file, one pattern per line.
    pub ignore_file: PathBuf,
    /// Diagnostic log of degraded mounts.
    pub mount_log: PathBuf,
    /// Serialized execution request.
    pub request_file: PathBuf,
    /// Classified changes in wire format.
    pub changes_file: PathBuf,
}

impl WorkspacePaths {
    /// Computes the paths for a workspace rooted at `root`.
    ///
    /// This only computes the paths; it does not create any directories.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            upper: root.join("upperdir"),
            work: root.join("workdir"),
            merged: root.join("temproot"),
            union_root: root.join("unionroot"),
            ignore_file: root.join("ignore"),
            mount_log: root.join("mount.log"),
            request_file: root.join("request.json"),
            changes_file: root.join("changes"),
            root,
        }
    }

    /// Creates the layer directories with 0700 permissions.
    ///
    /// Existing directories are left untouched apart from their mode.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::IoError` if directory creation fails.
    pub fn create_directories(&self) -> Result<(), WorkspaceError> {
        for dir in [
            &self.root,
            &self.upper,
            &self.work,
            &self.merged,
            &self.union_root,
        ] {
            fs::create_dir_all(dir).map_err(|e| WorkspaceError::IoError {
                context: format!("failed to create directory: {}", dir.display()),
                source: e,
            })?;

            let permissions = fs::Permissions::from_mode(DIR_PERMISSIONS);
            fs::set_permissions(dir, permissions).map_err(|e| WorkspaceError::IoError {
                context: format!("failed to set permissions on: {}", dir.display()),
                source: e,
            })?;
        }

        Ok(())
    }

    /// Checks that the merged root holds nothing but directories.
    ///
    /// Mount targets, device nodes and symlinks created during a run are
    /// removed on teardown, so any leftover non-directory entry means a run
    /// did not clean up or is still in progress.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::Invalid` naming the first stray entry.
    pub fn validate(&self) -> Result<(), WorkspaceError> {
        if !self.merged.exists() {
            return Ok(());
        }

        for entry in WalkDir::new(&self.merged)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| WorkspaceError::IoError {
                context: format!("failed to scan merged root: {}", self.merged.display()),
                source: e.into(),
            })?;

            if !entry.file_type().is_dir() {
                return Err(WorkspaceError::Invalid {
                    stray: entry.into_path(),
                });
            }
        }

        Ok(())
    }

    /// Requires the upper layer to exist (for `summary`/`commit`).
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::MissingDirectory` if `upperdir/` is absent.
    pub fn require_upper(&self) -> Result<(), WorkspaceError> {
        if self.upper.is_dir() {
            Ok(())
        } else {
            Err(WorkspaceError::MissingDirectory {
                name: "upperdir",
                path: self.upper.clone(),
            })
        }
    }

    /// Upper directory for a host mountpoint.
    #[must_use]
    pub fn upper_for(&self, mountpoint: &Path) -> PathBuf {
        join_under(&self.upper, mountpoint)
    }

    /// Work directory for a host mountpoint.
    #[must_use]
    pub fn work_for(&self, mountpoint: &Path) -> PathBuf {
        join_under(&self.work, mountpoint)
    }

    /// Location of a host path inside the merged root.
    #[must_use]
    pub fn merged_for(&self, host_path: &Path) -> PathBuf {
        join_under(&self.merged, host_path)
    }

    /// Mount target of the union-helper view for a host mountpoint.
    ///
    /// Flattened to a single path component so views never nest.
    #[must_use]
    pub fn union_for(&self, mountpoint: &Path) -> PathBuf {
        let name = mountpoint.to_string_lossy().replace('/', ".");
        self.union_root.join(name)
    }

    /// Removes the whole workspace tree.
    ///
    /// Should only be called after ensuring no mounts are active.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::IoError` if removal fails.
    pub fn cleanup(&self) -> Result<(), WorkspaceError> {
        if self.root.exists() {
            remove_tree(&self.root).map_err(|e| WorkspaceError::IoError {
                context: format!("failed to remove workspace: {}", self.root.display()),
                source: e,
            })?;
        }
        Ok(())
    }
}

/// Joins an absolute host path below `base`, dropping its root component.
#[must_use]
pub fn join_under(base: &Path, host_path: &Path) -> PathBuf {
    let mut joined = base.to_path_buf();
    for component in host_path.components() {
        if let Component::Normal(part) = component {
            joined.push(part);
        }
    }
    joined
}

/// Recursively removes `path`, restoring owner access on the way down.
///
/// OverlayFS leaves `work/` directories with mode 000 inside the work layer,
/// which `fs::remove_dir_all` cannot descend into.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if !metadata.is_dir() {
        return fs::remove_file(path);
    }

    let _ = fs::set_permissions(path, fs::Permissions::from_mode(DIR_PERMISSIONS));
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            remove_tree(&entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    fs::remove_dir(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn test_workspace_paths_new() {
        let paths = WorkspacePaths::new("/tmp/ws");

        assert_eq!(paths.upper, PathBuf::from("/tmp/ws/upperdir"));
        assert_eq!(paths.work, PathBuf::from("/tmp/ws/workdir"));
        assert_eq!(paths.merged, PathBuf::from("/tmp/ws/temproot"));
        assert_eq!(paths.ignore_file, PathBuf::from("/tmp/ws/ignore"));
        assert_eq!(paths.mount_log, PathBuf::from("/tmp/ws/mount.log"));
    }

    #[test]
    fn test_per_mountpoint_paths() {
        let paths = WorkspacePaths::new("/tmp/ws");
        let etc = Path::new("/etc");

        assert_eq!(paths.upper_for(etc), PathBuf::from("/tmp/ws/upperdir/etc"));
        assert_eq!(paths.work_for(etc), PathBuf::from("/tmp/ws/workdir/etc"));
        assert_eq!(paths.merged_for(etc), PathBuf::from("/tmp/ws/temproot/etc"));
        assert_eq!(paths.union_for(etc), PathBuf::from("/tmp/ws/unionroot/.etc"));
        assert_eq!(paths.merged_for(Path::new("/")), paths.merged);
    }

    #[test]
    fn test_create_and_cleanup() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let paths = WorkspacePaths::new(temp_dir.path().join("ws"));

        paths
            .create_directories()
            .expect("failed to create directories");
        assert!(paths.upper.is_dir());
        assert!(paths.work.is_dir());
        assert!(paths.merged.is_dir());
        assert!(paths.union_root.is_dir());

        let mode = fs::metadata(&paths.root)
            .expect("failed to read metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, DIR_PERMISSIONS);

        paths.cleanup().expect("failed to cleanup");
        assert!(!paths.root.exists());
    }

    #[test]
    fn test_validate_accepts_directories_only() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let paths = WorkspacePaths::new(temp_dir.path());
        paths
            .create_directories()
            .expect("failed to create directories");
        fs::create_dir_all(paths.merged.join("usr/lib")).expect("failed to create dirs");

        paths.validate().expect("directories only should be valid");
    }

    #[test]
    fn test_validate_rejects_stray_file() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let paths = WorkspacePaths::new(temp_dir.path());
        paths
            .create_directories()
            .expect("failed to create directories");
        fs::create_dir_all(paths.merged.join("dev")).expect("failed to create dev");
        File::create(paths.merged.join("dev/null")).expect("failed to create stray file");

        let err = paths.validate().expect_err("stray file must be rejected");
        assert!(matches!(err, WorkspaceError::Invalid { ref stray } if stray.ends_with("dev/null")));
    }

    #[test]
    fn test_validate_rejects_stray_symlink() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let paths = WorkspacePaths::new(temp_dir.path());
        paths
            .create_directories()
            .expect("failed to create directories");
        std::os::unix::fs::symlink("usr/bin", paths.merged.join("bin"))
            .expect("failed to create symlink");

        assert!(paths.validate().is_err());
    }

    #[test]
    fn test_remove_tree_handles_mode_000_directories() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let root = temp_dir.path().join("tree");
        let locked = root.join("work/work");
        fs::create_dir_all(locked.join("inner")).expect("failed to create dirs");
        File::create(locked.join("inner/file")).expect("failed to create file");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000))
            .expect("failed to lock directory");

        remove_tree(&root).expect("remove_tree should succeed");
        assert!(!root.exists());
    }

    #[test]
    fn test_require_upper() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let paths = WorkspacePaths::new(temp_dir.path());
        assert!(matches!(
            paths.require_upper(),
            Err(WorkspaceError::MissingDirectory { name: "upperdir", .. })
        ));

        paths
            .create_directories()
            .expect("failed to create directories");
        paths.require_upper().expect("upperdir exists now");
    }
}
