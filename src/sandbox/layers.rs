//! Copy-on-write root construction.
//!
//! Every top-level directory of the host root gets its own overlay inside the
//! workspace's merged root:
//!
//! ```text
//! lower:  {extra lower}/usr ... , {host}/usr
//! upper:  {workspace}/upperdir/usr
//! work:   {workspace}/workdir/usr
//! target: {workspace}/temproot/usr
//! ```
//!
//! A direct overlay fails when the host directory has other filesystems
//! mounted below it. The builder then asks a union-filesystem helper for a
//! flattened view of the directory and overlays on top of that view. When no
//! helper is available or it fails too, the directory stays unmounted and is
//! reported as degraded.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use tracing::{debug, instrument, trace, warn};

use super::host::HostOps;
use crate::error::MountError;
use crate::workspace::{WorkspacePaths, join_under};

/// Top-level paths never overlaid. The root only anchors the merged tree;
/// `/proc` and `/dev` are provided by the executor.
pub const SKIPPED_MOUNTPOINTS: &[&str] = &["/", "/proc", "/dev"];

/// What a mount point is on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Directory,
    Symlink,
    Other,
}

impl MountKind {
    /// Inspects `path` without following a final symlink.
    #[must_use]
    pub fn of(path: &Path) -> Self {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_symlink() => Self::Symlink,
            Ok(meta) if meta.is_dir() => Self::Directory,
            _ => Self::Other,
        }
    }
}

/// A host path that gets its own layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Absolute path relative to the host root (`/usr`).
    pub path: PathBuf,
    pub kind: MountKind,
}

/// Lists the host root and its immediate children, sorted.
///
/// # Errors
///
/// Returns an error if `host_root` cannot be read.
pub fn discover_mountpoints(host_root: &Path) -> io::Result<Vec<MountPoint>> {
    let mut paths = vec![PathBuf::from("/")];
    for entry in fs::read_dir(host_root)? {
        paths.push(Path::new("/").join(entry?.file_name()));
    }
    paths.sort();
    paths.dedup();

    Ok(paths
        .into_iter()
        .map(|path| {
            let kind = MountKind::of(&join_under(host_root, &path));
            MountPoint { path, kind }
        })
        .collect())
}

/// Resolves a `-L` directory to the directory that is stacked as a lower.
///
/// A directory that is itself a workspace contributes its upper layer, so the
/// changes of an earlier run become visible to the next one.
#[must_use]
pub fn resolve_lower_dir(dir: &Path) -> PathBuf {
    let upper = WorkspacePaths::new(dir).upper;
    if upper.is_dir() { upper } else { dir.to_path_buf() }
}

/// One overlay mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayLayer {
    /// Host mount point the layer covers.
    pub mountpoint: PathBuf,
    /// Lower directories, highest priority first.
    pub lower: Vec<PathBuf>,
    pub upper: PathBuf,
    pub work: PathBuf,
    /// Mount target inside the merged root.
    pub target: PathBuf,
}

/// What `LayerBuilder::build` put in place.
#[derive(Debug, Clone, Default)]
pub struct LayerReport {
    /// Mounted overlays, in mount order.
    pub layers: Vec<OverlayLayer>,
    /// Mounted union-helper views, in mount order.
    pub union_views: Vec<PathBuf>,
    /// Symlinks recreated in the merged root.
    pub symlinks: Vec<PathBuf>,
    /// Mount points left unmounted.
    pub degraded: Vec<PathBuf>,
}

/// Appends timestamped lines to the workspace mount log.
#[derive(Debug, Clone)]
pub struct MountLog {
    path: PathBuf,
}

impl MountLog {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Appends one line. Failures to write are logged and otherwise ignored.
    pub fn record(&self, message: &str) {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{timestamp} {message}"));

        if let Err(e) = result {
            warn!(error = %e, path = %self.path.display(), "Failed to write mount log");
        }
    }
}

/// Builds and tears down the per-mountpoint layers of a workspace.
pub struct LayerBuilder<'a, H: HostOps + ?Sized> {
    host: &'a H,
    paths: &'a WorkspacePaths,
    host_root: PathBuf,
    lower_dirs: Vec<PathBuf>,
    union_helper: Option<PathBuf>,
    log: MountLog,
}

impl<'a, H: HostOps + ?Sized> LayerBuilder<'a, H> {
    /// Creates a builder overlaying `host_root` into the workspace.
    #[must_use]
    pub fn new(host: &'a H, paths: &'a WorkspacePaths, host_root: impl Into<PathBuf>) -> Self {
        Self {
            host,
            paths,
            host_root: host_root.into(),
            lower_dirs: Vec::new(),
            union_helper: None,
            log: MountLog::new(&paths.mount_log),
        }
    }

    /// Stacks extra lower roots above the host, in priority order.
    #[must_use]
    pub fn with_lower_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.lower_dirs = dirs;
        self
    }

    /// Sets the union helper used for mount points with nested mounts.
    #[must_use]
    pub fn with_union_helper(mut self, helper: Option<PathBuf>) -> Self {
        self.union_helper = helper;
        self
    }

    /// Mounts one layer per directory mount point.
    ///
    /// A mount point whose overlay cannot be mounted is degraded, not fatal.
    ///
    /// # Errors
    ///
    /// Returns `MountError::LayerDirectory` if the workspace directories for a
    /// layer cannot be created. Layers mounted before the failure are torn
    /// down first.
    #[instrument(skip_all, fields(workspace = %self.paths.root.display(), count = mountpoints.len()))]
    pub fn build(&self, mountpoints: &[MountPoint]) -> Result<LayerReport, MountError> {
        let mut report = LayerReport::default();

        for mp in mountpoints {
            match mp.kind {
                MountKind::Symlink => {
                    self.recreate_symlink(mp, &mut report);
                    continue;
                }
                MountKind::Other => {
                    trace!(mountpoint = %mp.path.display(), "Skipping non-directory");
                    continue;
                }
                MountKind::Directory => {}
            }

            if SKIPPED_MOUNTPOINTS.iter().any(|s| mp.path == Path::new(s)) {
                continue;
            }

            if let Err(e) = self.prepare_directories(&mp.path) {
                if let Err(teardown) = self.teardown(&report) {
                    warn!(error = %teardown, "Teardown after failed build was incomplete");
                }
                return Err(e);
            }

            let real = join_under(&self.host_root, &mp.path);
            let direct = self.layer_on(&mp.path, &real);
            match self.host.mount_overlay(&direct) {
                Ok(()) => {
                    trace!(mountpoint = %mp.path.display(), "Overlay mounted");
                    report.layers.push(direct);
                    continue;
                }
                Err(e) => {
                    debug!(mountpoint = %mp.path.display(), error = %e, "Direct overlay failed");
                    self.log.record(&format!("{}: direct overlay failed: {e}", mp.path.display()));
                    for nested in self.host.nested_mounts(&mp.path) {
                        self.log.record(&format!(
                            "{}: nested mount {}",
                            mp.path.display(),
                            nested.display()
                        ));
                    }
                }
            }

            if let Err(e) = self.mount_through_helper(&mp.path, &real, &mut report) {
                warn!(mountpoint = %mp.path.display(), error = %e, "Mount point left unmounted");
                self.log.record(&format!("{}: left unmounted: {e}", mp.path.display()));
                report.degraded.push(mp.path.clone());
            }
        }

        debug!(
            layers = report.layers.len(),
            degraded = report.degraded.len(),
            "Layers built"
        );
        Ok(report)
    }

    /// Unmounts layers in reverse order, then the union views, then removes
    /// the recreated symlinks.
    ///
    /// Attempts every step and returns the first error.
    #[instrument(skip_all, fields(workspace = %self.paths.root.display()))]
    pub fn teardown(&self, report: &LayerReport) -> Result<(), MountError> {
        let mut first_error: Option<MountError> = None;

        let targets = report
            .layers
            .iter()
            .rev()
            .map(|layer| &layer.target)
            .chain(report.union_views.iter().rev());

        for target in targets {
            if let Err(e) = self.host.unmount(target) {
                warn!(error = %e, "Failed to unmount layer");
                first_error.get_or_insert(e);
            }
        }

        for link in &report.symlinks {
            if let Err(e) = fs::remove_file(link) {
                warn!(error = %e, link = %link.display(), "Failed to remove symlink");
                first_error.get_or_insert(MountError::LayerDirectory {
                    path: link.clone(),
                    source: e,
                });
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!("Layers torn down");
                Ok(())
            }
        }
    }

    fn layer_on(&self, mountpoint: &Path, top_lower: &Path) -> OverlayLayer {
        let mut lower: Vec<PathBuf> = self
            .lower_dirs
            .iter()
            .map(|dir| join_under(dir, mountpoint))
            .collect();
        lower.push(top_lower.to_path_buf());

        OverlayLayer {
            mountpoint: mountpoint.to_path_buf(),
            lower,
            upper: self.paths.upper_for(mountpoint),
            work: self.paths.work_for(mountpoint),
            target: self.paths.merged_for(mountpoint),
        }
    }

    /// Creates upper, work and target directories for a mount point. The upper
    /// directory takes the host directory's mode so the overlay root keeps it.
    fn prepare_directories(&self, mountpoint: &Path) -> Result<(), MountError> {
        let upper = self.paths.upper_for(mountpoint);
        for dir in [
            &upper,
            &self.paths.work_for(mountpoint),
            &self.paths.merged_for(mountpoint),
        ] {
            fs::create_dir_all(dir).map_err(|e| MountError::LayerDirectory {
                path: dir.clone(),
                source: e,
            })?;
        }

        let real = join_under(&self.host_root, mountpoint);
        if let Ok(meta) = fs::metadata(&real) {
            let mode = meta.permissions().mode() & 0o7777;
            fs::set_permissions(&upper, fs::Permissions::from_mode(mode)).map_err(|e| {
                MountError::LayerDirectory {
                    path: upper.clone(),
                    source: e,
                }
            })?;
        }
        Ok(())
    }

    fn mount_through_helper(
        &self,
        mountpoint: &Path,
        real: &Path,
        report: &mut LayerReport,
    ) -> Result<(), MountError> {
        let helper = self
            .union_helper
            .as_deref()
            .ok_or_else(|| MountError::UnionHelper("no union helper available".to_string()))?;

        let view = self.paths.union_for(mountpoint);
        fs::create_dir_all(&view).map_err(|e| MountError::LayerDirectory {
            path: view.clone(),
            source: e,
        })?;

        self.host.run_union_helper(helper, real, &view)?;

        let layer = self.layer_on(mountpoint, &view);
        if let Err(e) = self.host.mount_overlay(&layer) {
            if let Err(unmount) = self.host.unmount(&view) {
                warn!(error = %unmount, "Failed to unmount union view");
            }
            return Err(e);
        }

        debug!(mountpoint = %mountpoint.display(), helper = %helper.display(), "Overlay mounted on union view");
        self.log.record(&format!(
            "{}: mounted through {}",
            mountpoint.display(),
            helper.display()
        ));
        report.union_views.push(view);
        report.layers.push(layer);
        Ok(())
    }

    fn recreate_symlink(&self, mp: &MountPoint, report: &mut LayerReport) {
        let real = join_under(&self.host_root, &mp.path);
        let link = self.paths.merged_for(&mp.path);

        let result = fs::read_link(&real).and_then(|target| symlink(&target, &link));
        match result {
            Ok(()) => {
                trace!(link = %link.display(), "Recreated top-level symlink");
                report.symlinks.push(link);
            }
            Err(e) => {
                warn!(mountpoint = %mp.path.display(), error = %e, "Failed to recreate symlink");
                self.log
                    .record(&format!("{}: symlink not recreated: {e}", mp.path.display()));
            }
        }
    }
}
