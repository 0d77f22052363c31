//! Host requirement checks.

#![allow(unsafe_code)]

use std::fs;
use std::path::Path;

use nix::sched::{CloneFlags, unshare};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, fork};
use tracing::{debug, warn};

use crate::error::{Result, SystemRequirementsError};

/// Oldest kernel with unprivileged OverlayFS (`userxattr`).
pub const MIN_KERNEL_VERSION: (u32, u32) = (5, 11);

const USERNS_SYSCTL: &str = "/proc/sys/kernel/unprivileged_userns_clone";

/// Results of the host checks.
#[derive(Debug, Clone)]
pub struct SystemRequirements {
    /// Kernel version string (e.g., "6.7.0")
    pub kernel_version: String,
    pub kernel_major: u32,
    pub kernel_minor: u32,
    /// Whether unprivileged user namespaces are enabled
    pub user_namespaces: bool,
}

impl SystemRequirements {
    /// Whether the kernel supports unprivileged overlay mounts.
    #[must_use]
    pub fn has_unprivileged_overlay(&self) -> bool {
        kernel_at_least((self.kernel_major, self.kernel_minor), MIN_KERNEL_VERSION)
    }
}

/// Runs all host checks.
///
/// A kernel older than [`MIN_KERNEL_VERSION`] is only warned about: overlay
/// mounts may still work on distribution kernels with backports, and the
/// ones that fail degrade to empty directories.
///
/// # Errors
///
/// Returns `UserNamespacesDisabled` when the sandbox cannot be created at all.
pub fn check_all() -> Result<SystemRequirements> {
    let (kernel_version, kernel_major, kernel_minor) = check_kernel_version()?;
    let user_namespaces = check_user_namespaces()?;

    let reqs = SystemRequirements {
        kernel_version,
        kernel_major,
        kernel_minor,
        user_namespaces,
    };
    if !reqs.has_unprivileged_overlay() {
        warn!(
            "{}",
            SystemRequirementsError::KernelTooOld {
                found: reqs.kernel_version.clone(),
                required: format!("{}.{}", MIN_KERNEL_VERSION.0, MIN_KERNEL_VERSION.1),
            }
        );
    }
    debug!(kernel = %reqs.kernel_version, "System requirements checked");
    Ok(reqs)
}

/// Reads the running kernel's version.
///
/// # Returns
///
/// Tuple of (version_string, major, minor) on success.
///
/// # Errors
///
/// Returns error if the kernel version cannot be read or parsed.
pub fn check_kernel_version() -> Result<(String, u32, u32)> {
    let uname = nix::sys::utsname::uname().map_err(|e| SystemRequirementsError::ReadFailed {
        context: "uname syscall".to_string(),
        source: std::io::Error::from_raw_os_error(e as i32),
    })?;

    let release = uname.release().to_string_lossy().to_string();
    let (major, minor) = parse_kernel_version(&release)?;
    Ok((release, major, minor))
}

fn kernel_at_least(found: (u32, u32), required: (u32, u32)) -> bool {
    found.0 > required.0 || (found.0 == required.0 && found.1 >= required.1)
}

/// Parse kernel version string into (major, minor).
fn parse_kernel_version(version: &str) -> Result<(u32, u32)> {
    let parts: Vec<&str> = version.split('.').collect();

    if parts.len() < 2 {
        return Err(SystemRequirementsError::ReadFailed {
            context: format!("Failed to parse kernel version: {version}"),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Invalid kernel version format",
            ),
        }
        .into());
    }

    let major = parts[0]
        .parse::<u32>()
        .map_err(|_| SystemRequirementsError::ReadFailed {
            context: format!("Failed to parse kernel major version: {}", parts[0]),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "Invalid major version"),
        })?;

    // "15-generic" and the like
    let minor_str = parts[1]
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .unwrap_or("0");
    let minor = minor_str
        .parse::<u32>()
        .map_err(|_| SystemRequirementsError::ReadFailed {
            context: format!("Failed to parse kernel minor version: {}", parts[1]),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "Invalid minor version"),
        })?;

    Ok((major, minor))
}

/// Checks that unprivileged user namespaces are enabled.
///
/// Reads the Debian-style sysctl if it exists; otherwise tries to create a
/// user namespace in a throwaway child.
///
/// # Errors
///
/// Returns error if user namespaces are disabled.
pub fn check_user_namespaces() -> Result<bool> {
    let userns_path = Path::new(USERNS_SYSCTL);
    if !userns_path.exists() {
        return verify_userns_by_unshare();
    }

    let content =
        fs::read_to_string(userns_path).map_err(|e| SystemRequirementsError::ReadFailed {
            context: "unprivileged_userns_clone".to_string(),
            source: e,
        })?;

    if content.trim().parse::<u32>().unwrap_or(0) != 1 {
        return Err(SystemRequirementsError::UserNamespacesDisabled.into());
    }
    Ok(true)
}

fn verify_userns_by_unshare() -> Result<bool> {
    // SAFETY: the child only calls unshare and _exit.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, 0)) => Ok(true),
            _ => Err(SystemRequirementsError::UserNamespacesDisabled.into()),
        },
        Ok(ForkResult::Child) => {
            let code = i32::from(unshare(CloneFlags::CLONE_NEWUSER).is_err());
            // SAFETY: leaves the child without running the parent's destructors.
            unsafe { libc::_exit(code) }
        }
        Err(e) => Err(SystemRequirementsError::ReadFailed {
            context: "fork for userns test".to_string(),
            source: std::io::Error::from_raw_os_error(e as i32),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_version_standard() {
        let (major, minor) = parse_kernel_version("6.7.0").expect("should parse");
        assert_eq!(major, 6);
        assert_eq!(minor, 7);
    }

    #[test]
    fn test_parse_kernel_version_with_suffix() {
        let (major, minor) = parse_kernel_version("5.15.0-generic").expect("should parse");
        assert_eq!(major, 5);
        assert_eq!(minor, 15);
    }

    #[test]
    fn test_parse_kernel_version_ubuntu_style() {
        let (major, minor) = parse_kernel_version("6.7.0-8-generic").expect("should parse");
        assert_eq!(major, 6);
        assert_eq!(minor, 7);
    }

    #[test]
    fn test_parse_kernel_version_rejects_garbage() {
        assert!(parse_kernel_version("linux").is_err());
        assert!(parse_kernel_version("x.1").is_err());
    }

    #[test]
    fn test_kernel_at_least() {
        assert!(kernel_at_least((5, 11), MIN_KERNEL_VERSION));
        assert!(kernel_at_least((6, 1), MIN_KERNEL_VERSION));
        assert!(!kernel_at_least((5, 10), MIN_KERNEL_VERSION));
        assert!(!kernel_at_least((4, 19), MIN_KERNEL_VERSION));
    }

    #[test]
    fn test_check_kernel_version_real() {
        let (version, major, _) = check_kernel_version().expect("uname should work");
        assert!(!version.is_empty());
        assert!(major >= 2);
    }
}
