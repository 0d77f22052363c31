//! Host operations used by the layer builder, the executor and the change
//! classifier.
//!
//! Everything that needs privileges inside a user namespace, or that reads
//! overlay-private markers, goes through [`HostOps`]. [`LinuxHost`] performs
//! the real system calls; [`fake::FakeHost`] records calls and answers marker
//! lookups from memory so the layer and classification logic can be tested
//! without a kernel overlay.

#![allow(unsafe_code)]

pub mod fake;

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::sched::{CloneFlags, unshare};
use nix::unistd::{getgid, getuid};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

use super::layers::OverlayLayer;
use super::{mountinfo, mounts};
use crate::error::{ExecError, MountError};

/// Extended attributes marking an opaque directory.
pub const OPAQUE_XATTRS: &[&str] = &["trusted.overlay.opaque", "user.overlay.opaque"];

/// Extended attributes marking a whiteout stored as a regular file.
pub const WHITEOUT_XATTRS: &[&str] = &["trusted.overlay.whiteout", "user.overlay.whiteout"];

/// Namespaces the sandbox holder enters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceOptions {
    /// Also create a network namespace (loopback only).
    pub isolate_network: bool,
}

impl NamespaceOptions {
    /// Clone flags for the holder's `unshare(2)`. The PID namespace is not
    /// among them; see [`HostOps::enter_pid_namespace`].
    #[must_use]
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS;
        if self.isolate_network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        flags
    }
}

/// Operating-system operations the sandbox depends on.
pub trait HostOps {
    /// Mounts one overlay layer onto its target.
    fn mount_overlay(&self, layer: &OverlayLayer) -> Result<(), MountError>;

    /// Runs the union-filesystem helper to expose `source` (with everything
    /// mounted below it) at `target`.
    fn run_union_helper(&self, helper: &Path, source: &Path, target: &Path)
    -> Result<(), MountError>;

    /// Bind-mounts `source` onto the existing `target`.
    fn bind_mount(&self, source: &Path, target: &Path) -> Result<(), MountError>;

    /// Mounts a fresh procfs at `target`.
    fn mount_proc(&self, target: &Path) -> Result<(), MountError>;

    /// Unmounts `target`.
    fn unmount(&self, target: &Path) -> Result<(), MountError>;

    /// Moves the calling process into new namespaces, mapping the caller to
    /// root, and makes all mounts private.
    fn enter_namespaces(&self, options: &NamespaceOptions) -> Result<(), ExecError>;

    /// Creates a PID namespace for the calling process's next child, which
    /// becomes its init. Nothing else may be forked between this call and the
    /// command.
    fn enter_pid_namespace(&self) -> Result<(), ExecError>;

    /// Host mounts nested strictly below `mountpoint`.
    fn nested_mounts(&self, mountpoint: &Path) -> Vec<PathBuf>;

    /// True if `dir` carries an opaque-directory marker.
    fn is_opaque(&self, dir: &Path) -> bool;

    /// True if the regular file `file` carries a whiteout marker.
    fn is_whiteout(&self, file: &Path) -> bool;
}

/// The real Linux host.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxHost;

impl HostOps for LinuxHost {
    fn mount_overlay(&self, layer: &OverlayLayer) -> Result<(), MountError> {
        mounts::mount_overlay(&layer.lower, &layer.upper, &layer.work, &layer.target)
    }

    #[instrument(skip_all, fields(helper = %helper.display(), source = %source.display()))]
    fn run_union_helper(
        &self,
        helper: &Path,
        source: &Path,
        target: &Path,
    ) -> Result<(), MountError> {
        debug!(target = %target.display(), "Starting union helper");

        let output = Command::new(helper)
            .arg(source)
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| MountError::UnionHelper(format!("{}: {e}", helper.display())))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(MountError::UnionHelper(format!(
                "{} exited with {}: {}",
                helper.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<(), MountError> {
        mounts::bind_mount(source, target)
    }

    fn mount_proc(&self, target: &Path) -> Result<(), MountError> {
        mounts::mount_proc(target)
    }

    fn unmount(&self, target: &Path) -> Result<(), MountError> {
        mounts::unmount(target)
    }

    #[instrument(skip_all, fields(network = options.isolate_network))]
    fn enter_namespaces(&self, options: &NamespaceOptions) -> Result<(), ExecError> {
        let uid = getuid();
        let gid = getgid();

        unshare(options.clone_flags())
            .map_err(|e| ExecError::NamespaceCreation(format!("unshare: {e}")))?;

        // setgroups must be denied before an unprivileged gid_map write.
        write_proc("/proc/self/setgroups", "deny")?;
        write_proc("/proc/self/uid_map", &format!("0 {uid} 1"))?;
        write_proc("/proc/self/gid_map", &format!("0 {gid} 1"))?;

        mounts::make_private().map_err(|e| ExecError::NamespaceCreation(e.to_string()))?;

        debug!(%uid, %gid, "Entered namespaces");
        Ok(())
    }

    fn enter_pid_namespace(&self) -> Result<(), ExecError> {
        unshare(CloneFlags::CLONE_NEWPID)
            .map_err(|e| ExecError::NamespaceCreation(format!("unshare(pid): {e}")))?;
        trace!("PID namespace ready for the command");
        Ok(())
    }

    fn nested_mounts(&self, mountpoint: &Path) -> Vec<PathBuf> {
        match mountinfo::read_nested(Path::new(mountinfo::SELF_MOUNTINFO), mountpoint) {
            Ok(nested) => nested,
            Err(e) => {
                warn!(error = %e, "Failed to read mount table");
                Vec::new()
            }
        }
    }

    fn is_opaque(&self, dir: &Path) -> bool {
        OPAQUE_XATTRS
            .iter()
            .any(|name| get_xattr(dir, name).is_some_and(|value| value == b"y"))
    }

    fn is_whiteout(&self, file: &Path) -> bool {
        WHITEOUT_XATTRS
            .iter()
            .any(|name| get_xattr(file, name).is_some())
    }
}

fn write_proc(path: &str, content: &str) -> Result<(), ExecError> {
    fs::write(path, content)
        .map_err(|e| ExecError::NamespaceCreation(format!("failed to write {path}: {e}")))
}

/// Reads an extended attribute without following symlinks.
///
/// The value is sized with a zero-length query first; a value that grows
/// between the two calls is retried.
fn get_xattr(path: &Path, name: &str) -> Option<Vec<u8>> {
    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let c_name = CString::new(name).ok()?;

    loop {
        // SAFETY: both strings are NUL-terminated; a null buffer with size 0
        // only queries the value's length.
        let size = unsafe {
            libc::lgetxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0)
        };
        let mut buf = vec![0u8; usize::try_from(size).ok()?];

        // SAFETY: `buf` is valid for `buf.len()` bytes for the duration of
        // the call.
        let len = unsafe {
            libc::lgetxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };

        match usize::try_from(len) {
            Ok(len) => {
                buf.truncate(len);
                return Some(buf);
            }
            Err(_) if io::Error::last_os_error().raw_os_error() == Some(libc::ERANGE) => continue,
            Err(_) => return None,
        }
    }
}
