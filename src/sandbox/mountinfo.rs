//! `/proc/self/mountinfo` parsing.
//!
//! Only the mount point field (index 4) is used: it tells which host paths
//! carry mounts nested below a top-level directory, the case a direct overlay
//! cannot cover.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Location of the mount table of the calling process.
pub const SELF_MOUNTINFO: &str = "/proc/self/mountinfo";

/// Extracts the mount points listed in a mountinfo table.
#[must_use]
pub fn parse_mount_points(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|field| PathBuf::from(unescape(field)))
        .collect()
}

/// Mount points strictly below `mountpoint`, sorted and deduplicated.
#[must_use]
pub fn nested_under(mount_points: &[PathBuf], mountpoint: &Path) -> Vec<PathBuf> {
    let mut nested: Vec<PathBuf> = mount_points
        .iter()
        .filter(|mp| mp.as_path() != mountpoint && mp.starts_with(mountpoint))
        .cloned()
        .collect();
    nested.sort();
    nested.dedup();
    nested
}

/// Reads `table` and returns the mounts nested below `mountpoint`.
///
/// # Errors
///
/// Returns an error if the table cannot be read.
pub fn read_nested(table: &Path, mountpoint: &Path) -> io::Result<Vec<PathBuf>> {
    let content = fs::read_to_string(table)?;
    Ok(nested_under(&parse_mount_points(&content), mountpoint))
}

/// Decodes the `\ooo` octal escapes the kernel uses for space, tab, newline
/// and backslash.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value =
                (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3
        && (b'0'..=b'3').contains(&digits[0])
        && digits[1..].iter().all(|d| (b'0'..=b'7').contains(d))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
23 22 0:21 / /proc rw,nosuid shared:12 - proc proc rw
24 22 0:5 / /dev rw,nosuid shared:2 - devtmpfs udev rw
30 22 8:2 / /home rw,relatime shared:20 - ext4 /dev/sda2 rw
31 30 0:40 / /home/user/My\\040Drive rw,relatime shared:21 - fuse.gdrive gdrive rw
32 22 0:41 / /homework rw,relatime shared:22 - tmpfs tmpfs rw
";

    #[test]
    fn test_parse_mount_points() {
        let points = parse_mount_points(SAMPLE);
        assert_eq!(points.len(), 6);
        assert_eq!(points[0], PathBuf::from("/"));
        assert_eq!(points[4], PathBuf::from("/home/user/My Drive"));
    }

    #[test]
    fn test_nested_under_is_component_wise() {
        let points = parse_mount_points(SAMPLE);
        let nested = nested_under(&points, Path::new("/home"));
        assert_eq!(nested, vec![PathBuf::from("/home/user/My Drive")]);
    }

    #[test]
    fn test_no_nested_mounts() {
        let points = parse_mount_points(SAMPLE);
        assert!(nested_under(&points, Path::new("/usr")).is_empty());
    }

    #[test]
    fn test_unescape_leaves_plain_backslashes() {
        assert_eq!(unescape("a\\b"), "a\\b");
        assert_eq!(unescape("tab\\011x"), "tab\tx");
        assert_eq!(unescape("back\\134slash"), "back\\slash");
    }
}
