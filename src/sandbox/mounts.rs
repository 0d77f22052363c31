//! Mount primitives used inside the sandbox's mount namespace.
//!
//! # OverlayFS Requirements
//!
//! - Kernel 5.11+ for unprivileged OverlayFS in user namespaces
//! - Must use `userxattr` mount option
//! - Work directory must be on same filesystem as upper directory
//! - Work directory must be empty before mount

use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use tracing::{debug, instrument, trace, warn};

use crate::error::MountError;

/// Renders the OverlayFS option string for a layer.
///
/// Lower directories that do not exist are dropped. Returns `None` when no
/// lower directory is left.
#[must_use]
pub fn overlay_options(lower: &[PathBuf], upper: &Path, work: &Path) -> Option<String> {
    let lower_str = lower
        .iter()
        .filter(|p| p.exists())
        .map(|p| escape_option(&p.to_string_lossy()))
        .collect::<Vec<_>>()
        .join(":");

    if lower_str.is_empty() {
        return None;
    }

    Some(format!(
        "lowerdir={},upperdir={},workdir={},userxattr",
        lower_str,
        escape_option(&upper.to_string_lossy()),
        escape_option(&work.to_string_lossy())
    ))
}

/// Escapes the characters overlayfs treats as lowerdir separators.
fn escape_option(value: &str) -> String {
    value.replace('\\', "\\\\").replace(':', "\\:")
}

/// Mounts OverlayFS combining lower (read-only) and upper (writable) layers.
///
/// # Arguments
///
/// * `lower` - Read-only directories, highest priority first
/// * `upper` - Writable upper layer for modifications
/// * `work` - Work directory for OverlayFS internal use
/// * `merged` - Mount point for the combined view
///
/// # Errors
///
/// Returns `MountError::OverlayMount` if no lower directory exists or the
/// mount operation fails.
#[instrument(skip_all, fields(merged = %merged.display()))]
pub fn mount_overlay(
    lower: &[PathBuf],
    upper: &Path,
    work: &Path,
    merged: &Path,
) -> Result<(), MountError> {
    debug!("Mounting OverlayFS");

    let options = overlay_options(lower, upper, work).ok_or_else(|| {
        MountError::OverlayMount("no valid lower directories found".to_string())
    })?;

    trace!(options = %options, "OverlayFS mount options");

    mount(
        Some("overlay"),
        merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .map_err(|e| MountError::OverlayMount(format!("{}: {e}", merged.display())))?;

    debug!("OverlayFS mounted successfully");
    Ok(())
}

/// Mounts a fresh procfs for the sandbox's PID namespace.
///
/// Must be called from a process inside the new PID namespace so the mounted
/// instance shows only the sandboxed processes.
///
/// # Errors
///
/// Returns `MountError::ProcMount` if the mount operation fails.
#[instrument(skip_all, fields(target = %target.display()))]
pub fn mount_proc(target: &Path) -> Result<(), MountError> {
    debug!("Mounting procfs");

    mount(
        Some("proc"),
        target,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| MountError::ProcMount(format!("{}: {e}", target.display())))?;

    debug!("procfs mounted successfully");
    Ok(())
}

/// Bind-mounts a single host file or directory onto `target`.
///
/// The target must already exist and be of the same type as the source.
///
/// # Errors
///
/// Returns `MountError::BindMount` if the mount operation fails.
#[instrument(skip_all, fields(source = %source.display(), target = %target.display()))]
pub fn bind_mount(source: &Path, target: &Path) -> Result<(), MountError> {
    trace!("Creating bind mount");

    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| MountError::BindMount(format!("{} -> {}: {e}", source.display(), target.display())))?;

    trace!("Bind mount created");
    Ok(())
}

/// Makes every mount in the current namespace private.
///
/// Run right after entering a new mount namespace so nothing mounted in the
/// sandbox propagates back to the host.
///
/// # Errors
///
/// Returns `MountError::BindMount` if the propagation change is rejected.
pub fn make_private() -> Result<(), MountError> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| MountError::BindMount(format!("failed to make / private: {e}")))
}

/// Unmounts a filesystem.
///
/// Uses `MNT_DETACH` (lazy unmount) as a fallback if normal unmount fails.
///
/// # Errors
///
/// Returns `MountError::Unmount` if both normal and lazy unmount fail.
#[instrument(skip_all, fields(target = %target.display()))]
pub fn unmount(target: &Path) -> Result<(), MountError> {
    debug!("Unmounting filesystem");

    match umount2(target, MntFlags::empty()) {
        Ok(()) => {
            debug!("Filesystem unmounted successfully");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "Normal unmount failed, trying lazy unmount");

            umount2(target, MntFlags::MNT_DETACH).map_err(|e| {
                MountError::Unmount(format!("{}: lazy unmount failed: {e}", target.display()))
            })?;

            debug!("Filesystem unmounted with MNT_DETACH");
            Ok(())
        }
    }
}
