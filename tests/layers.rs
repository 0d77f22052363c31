//! Integration tests for layer construction.
//!
//! These tests verify:
//! - One overlay per top-level directory, with `/`, `/proc` and `/dev` skipped
//! - Top-level symlinks are recreated instead of overlaid
//! - Extra lower directories stack above the host in the given order
//! - Mount points with nested mounts fall back to the union helper
//! - Without a helper such mount points degrade and are logged
//! - Teardown leaves a workspace that validates

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use cowrun::sandbox::host::fake::{FakeHost, HostCall};
use cowrun::sandbox::layers::{LayerBuilder, discover_mountpoints};
use cowrun::workspace::Workspace;
use tempfile::TempDir;

/// A fake host root with a few top-level entries and a fresh workspace.
struct Fixture {
    workspace: Workspace,
    host_root: PathBuf,
    _dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let host_root = dir.path().join("root");
        for name in ["dev", "etc", "home", "proc", "usr"] {
            fs::create_dir_all(host_root.join(name)).expect("failed to create host dir");
        }
        fs::write(host_root.join("etc/hostname"), "box\n").expect("failed to write file");
        symlink("usr/bin", host_root.join("bin")).expect("failed to create symlink");
        fs::write(host_root.join("swapfile"), "").expect("failed to write file");

        let scratch = dir.path().join("scratch");
        fs::create_dir(&scratch).expect("failed to create scratch dir");
        let workspace = Workspace::acquire(None, &scratch, "layers").expect("acquire workspace");

        Self {
            workspace,
            host_root,
            _dir: dir,
        }
    }

    fn builder<'a>(&'a self, host: &'a FakeHost) -> LayerBuilder<'a, FakeHost> {
        LayerBuilder::new(host, self.workspace.paths(), &self.host_root)
    }

    fn merged(&self, path: &str) -> PathBuf {
        self.workspace.paths().merged_for(Path::new(path))
    }
}

fn overlay_targets(host: &FakeHost) -> Vec<PathBuf> {
    host.calls()
        .into_iter()
        .filter_map(|call| match call {
            HostCall::MountOverlay { target, .. } => Some(target),
            _ => None,
        })
        .collect()
}

#[test]
fn test_one_overlay_per_directory() {
    let fixture = Fixture::new();
    let host = FakeHost::new();
    let mountpoints = discover_mountpoints(&fixture.host_root).expect("discover");

    let report = fixture.builder(&host).build(&mountpoints).expect("build");

    assert_eq!(
        overlay_targets(&host),
        vec![fixture.merged("/etc"), fixture.merged("/home"), fixture.merged("/usr")]
    );
    assert_eq!(report.layers.len(), 3);
    assert!(report.degraded.is_empty());

    let etc = &report.layers[0];
    assert_eq!(etc.lower, vec![fixture.host_root.join("etc")]);
    assert_eq!(etc.upper, fixture.workspace.paths().upper.join("etc"));
    assert!(etc.upper.is_dir());
    assert!(etc.work.is_dir());
}

#[test]
fn test_top_level_symlink_is_recreated() {
    let fixture = Fixture::new();
    let host = FakeHost::new();
    let mountpoints = discover_mountpoints(&fixture.host_root).expect("discover");

    let report = fixture.builder(&host).build(&mountpoints).expect("build");

    assert_eq!(report.symlinks, vec![fixture.merged("/bin")]);
    assert_eq!(
        fs::read_link(fixture.merged("/bin")).expect("read link"),
        PathBuf::from("usr/bin")
    );
    assert!(!overlay_targets(&host).contains(&fixture.merged("/bin")));
    assert!(!fixture.merged("/swapfile").exists());
}

#[test]
fn test_lower_dirs_stack_above_host() {
    let fixture = Fixture::new();
    let host = FakeHost::new();
    let first = TempDir::new().expect("failed to create temp dir");
    let second = TempDir::new().expect("failed to create temp dir");
    let mountpoints = discover_mountpoints(&fixture.host_root).expect("discover");

    let report = fixture
        .builder(&host)
        .with_lower_dirs(vec![first.path().to_path_buf(), second.path().to_path_buf()])
        .build(&mountpoints)
        .expect("build");

    assert_eq!(
        report.layers[0].lower,
        vec![
            first.path().join("etc"),
            second.path().join("etc"),
            fixture.host_root.join("etc"),
        ]
    );
}

#[test]
fn test_nested_mounts_fall_back_to_union_helper() {
    let fixture = Fixture::new();
    let home = fixture.host_root.join("home");
    let host = FakeHost::new()
        .with_rejected_lower(&home)
        .with_nested_mounts("/home", vec![PathBuf::from("/home/alice")]);
    let mountpoints = discover_mountpoints(&fixture.host_root).expect("discover");

    let report = fixture
        .builder(&host)
        .with_union_helper(Some(PathBuf::from("/usr/bin/mergerfs")))
        .build(&mountpoints)
        .expect("build");

    let view = fixture.workspace.paths().union_for(Path::new("/home"));
    assert!(host.calls().contains(&HostCall::UnionHelper {
        helper: PathBuf::from("/usr/bin/mergerfs"),
        source: home,
        target: view.clone(),
    }));
    assert_eq!(report.union_views, vec![view.clone()]);
    assert!(report.degraded.is_empty());

    let layer = report
        .layers
        .iter()
        .find(|layer| layer.mountpoint == Path::new("/home"))
        .expect("home layer");
    assert_eq!(layer.lower, vec![view]);

    let log = fs::read_to_string(&fixture.workspace.paths().mount_log).expect("read mount log");
    assert!(log.contains("/home: nested mount /home/alice"));
    assert!(log.contains("mounted through /usr/bin/mergerfs"));
}

#[test]
fn test_without_helper_mount_point_degrades() {
    let fixture = Fixture::new();
    let host = FakeHost::new().with_rejected_lower(fixture.host_root.join("home"));
    let mountpoints = discover_mountpoints(&fixture.host_root).expect("discover");

    let report = fixture.builder(&host).build(&mountpoints).expect("build");

    assert_eq!(report.degraded, vec![PathBuf::from("/home")]);
    assert_eq!(report.layers.len(), 2);
    assert!(fixture.merged("/home").is_dir());

    let log = fs::read_to_string(&fixture.workspace.paths().mount_log).expect("read mount log");
    assert!(log.contains("/home: left unmounted"));
}

#[test]
fn test_failing_helper_degrades() {
    let fixture = Fixture::new();
    let host = FakeHost::new()
        .with_rejected_lower(fixture.host_root.join("home"))
        .with_failing_helper();
    let mountpoints = discover_mountpoints(&fixture.host_root).expect("discover");

    let report = fixture
        .builder(&host)
        .with_union_helper(Some(PathBuf::from("/usr/bin/unionfs")))
        .build(&mountpoints)
        .expect("build");

    assert_eq!(report.degraded, vec![PathBuf::from("/home")]);
    assert!(report.union_views.is_empty());
}

#[test]
fn test_teardown_leaves_valid_workspace() {
    let fixture = Fixture::new();
    let home = fixture.host_root.join("home");
    let host = FakeHost::new().with_rejected_lower(&home);
    let mountpoints = discover_mountpoints(&fixture.host_root).expect("discover");
    let builder = fixture
        .builder(&host)
        .with_union_helper(Some(PathBuf::from("/usr/bin/mergerfs")));

    let report = builder.build(&mountpoints).expect("build");
    assert!(fixture.workspace.paths().validate().is_err(), "symlink is a stray entry");

    builder.teardown(&report).expect("teardown");

    assert!(host.active_mounts().is_empty());
    fixture
        .workspace
        .paths()
        .validate()
        .expect("workspace should validate after teardown");
}
