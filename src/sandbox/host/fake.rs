//! In-memory [`HostOps`] implementation for tests.
//!
//! Mounts are recorded instead of performed. Overlay-private markers that an
//! unprivileged test cannot create (trusted xattrs, 0:0 device nodes) are
//! registered on the fake and answered from memory.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{HostOps, NamespaceOptions};
use crate::error::{ExecError, MountError};
use crate::sandbox::layers::OverlayLayer;

/// A recorded host operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    MountOverlay { lower: Vec<PathBuf>, target: PathBuf },
    UnionHelper { helper: PathBuf, source: PathBuf, target: PathBuf },
    BindMount { source: PathBuf, target: PathBuf },
    MountProc { target: PathBuf },
    Unmount { target: PathBuf },
    EnterNamespaces { isolate_network: bool },
    EnterPidNamespace,
}

/// Recording host.
#[derive(Debug, Default)]
pub struct FakeHost {
    calls: Mutex<Vec<HostCall>>,
    rejected_lowers: HashSet<PathBuf>,
    helper_fails: bool,
    namespaces_fail: bool,
    nested: HashMap<PathBuf, Vec<PathBuf>>,
    opaque: Mutex<HashSet<PathBuf>>,
    whiteouts: Mutex<HashSet<PathBuf>>,
}

impl FakeHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every overlay mount whose lower list contains `lower`.
    #[must_use]
    pub fn with_rejected_lower(mut self, lower: impl Into<PathBuf>) -> Self {
        self.rejected_lowers.insert(lower.into());
        self
    }

    /// Makes every union-helper run fail.
    #[must_use]
    pub fn with_failing_helper(mut self) -> Self {
        self.helper_fails = true;
        self
    }

    /// Makes namespace entry fail as if user namespaces were disabled.
    #[must_use]
    pub fn with_failing_namespaces(mut self) -> Self {
        self.namespaces_fail = true;
        self
    }

    /// Reports `nested` as mounted below `mountpoint`.
    #[must_use]
    pub fn with_nested_mounts(mut self, mountpoint: impl Into<PathBuf>, nested: Vec<PathBuf>) -> Self {
        self.nested.insert(mountpoint.into(), nested);
        self
    }

    /// Marks `dir` as an opaque directory.
    pub fn mark_opaque(&self, dir: impl Into<PathBuf>) {
        lock(&self.opaque).insert(dir.into());
    }

    /// Marks `file` as a whiteout.
    pub fn mark_whiteout(&self, file: impl Into<PathBuf>) {
        lock(&self.whiteouts).insert(file.into());
    }

    /// All calls recorded so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<HostCall> {
        lock(&self.calls).clone()
    }

    /// Targets currently mounted (mounted and not yet unmounted).
    #[must_use]
    pub fn active_mounts(&self) -> Vec<PathBuf> {
        let mut active: Vec<PathBuf> = Vec::new();
        for call in lock(&self.calls).iter() {
            match call {
                HostCall::MountOverlay { target, .. }
                | HostCall::UnionHelper { target, .. }
                | HostCall::BindMount { target, .. }
                | HostCall::MountProc { target } => active.push(target.clone()),
                HostCall::Unmount { target } => {
                    if let Some(pos) = active.iter().rposition(|t| t == target) {
                        active.remove(pos);
                    }
                }
                HostCall::EnterNamespaces { .. } | HostCall::EnterPidNamespace => {}
            }
        }
        active
    }

    fn record(&self, call: HostCall) {
        lock(&self.calls).push(call);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl HostOps for FakeHost {
    fn mount_overlay(&self, layer: &OverlayLayer) -> Result<(), MountError> {
        if layer.lower.iter().any(|l| self.rejected_lowers.contains(l)) {
            return Err(MountError::OverlayMount(format!(
                "{}: rejected by fake host",
                layer.target.display()
            )));
        }
        self.record(HostCall::MountOverlay {
            lower: layer.lower.clone(),
            target: layer.target.clone(),
        });
        Ok(())
    }

    fn run_union_helper(
        &self,
        helper: &Path,
        source: &Path,
        target: &Path,
    ) -> Result<(), MountError> {
        if self.helper_fails {
            return Err(MountError::UnionHelper(format!(
                "{} failed on fake host",
                helper.display()
            )));
        }
        self.record(HostCall::UnionHelper {
            helper: helper.to_path_buf(),
            source: source.to_path_buf(),
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<(), MountError> {
        self.record(HostCall::BindMount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn mount_proc(&self, target: &Path) -> Result<(), MountError> {
        self.record(HostCall::MountProc {
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), MountError> {
        self.record(HostCall::Unmount {
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn enter_namespaces(&self, options: &NamespaceOptions) -> Result<(), ExecError> {
        if self.namespaces_fail {
            return Err(ExecError::NamespaceCreation(
                "unshare: EPERM (fake host)".to_string(),
            ));
        }
        self.record(HostCall::EnterNamespaces {
            isolate_network: options.isolate_network,
        });
        Ok(())
    }

    fn enter_pid_namespace(&self) -> Result<(), ExecError> {
        self.record(HostCall::EnterPidNamespace);
        Ok(())
    }

    fn nested_mounts(&self, mountpoint: &Path) -> Vec<PathBuf> {
        self.nested.get(mountpoint).cloned().unwrap_or_default()
    }

    fn is_opaque(&self, dir: &Path) -> bool {
        lock(&self.opaque).contains(dir)
    }

    fn is_whiteout(&self, file: &Path) -> bool {
        lock(&self.whiteouts).contains(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(lower: &str, target: &str) -> OverlayLayer {
        OverlayLayer {
            mountpoint: PathBuf::from("/usr"),
            lower: vec![PathBuf::from(lower)],
            upper: PathBuf::from("/ws/upperdir/usr"),
            work: PathBuf::from("/ws/workdir/usr"),
            target: PathBuf::from(target),
        }
    }

    #[test]
    fn test_active_mounts_track_unmounts() {
        let host = FakeHost::new();
        host.mount_overlay(&layer("/usr", "/ws/temproot/usr"))
            .expect("mount");
        host.mount_proc(Path::new("/ws/temproot/proc"))
            .expect("proc");
        host.unmount(Path::new("/ws/temproot/proc")).expect("unmount");

        assert_eq!(host.active_mounts(), vec![PathBuf::from("/ws/temproot/usr")]);
    }

    #[test]
    fn test_rejected_lower_fails_overlay() {
        let host = FakeHost::new().with_rejected_lower("/usr");
        assert!(host.mount_overlay(&layer("/usr", "/t")).is_err());
        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_markers_are_path_exact() {
        let host = FakeHost::new();
        host.mark_whiteout("/ws/upperdir/etc/gone");
        assert!(host.is_whiteout(Path::new("/ws/upperdir/etc/gone")));
        assert!(!host.is_whiteout(Path::new("/ws/upperdir/etc")));
        assert!(!host.is_opaque(Path::new("/ws/upperdir/etc/gone")));
    }
}
