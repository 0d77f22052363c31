//! Integration tests for change classification and commit.
//!
//! These tests verify:
//! - Classification is idempotent on an unchanged upper layer
//! - Added, modified and deleted files round-trip onto the host
//! - Opaque directories replace their host counterpart
//! - Ignore patterns suppress records in both classify and commit
//!
//! Whiteouts and opaque markers are registered on the fake host, so none of
//! this needs privileges or a kernel overlay.

use std::fs;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};

use cowrun::changes::{ChangeClassifier, ChangeKind, ChangeRecord, CommitEngine, read_records, write_records};
use cowrun::sandbox::host::fake::FakeHost;
use cowrun::workspace::IgnoreFilter;
use tempfile::TempDir;

/// An upper layer and the host tree it shadows.
struct Trees {
    _dir: TempDir,
    upper: PathBuf,
    host: PathBuf,
}

impl Trees {
    fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let upper = dir.path().join("upperdir");
        let host = dir.path().join("host");
        fs::create_dir_all(upper.join("data")).expect("failed to create upper");
        fs::create_dir_all(host.join("data")).expect("failed to create host");
        Self {
            _dir: dir,
            upper,
            host,
        }
    }

    fn upper_path(&self, path: &str) -> PathBuf {
        self.upper.join(path.trim_start_matches('/'))
    }

    fn host_path(&self, path: &str) -> PathBuf {
        self.host.join(path.trim_start_matches('/'))
    }

    fn write_upper(&self, path: &str, contents: &str) {
        write_file(&self.upper_path(path), contents);
    }

    fn write_host(&self, path: &str, contents: &str) {
        write_file(&self.host_path(path), contents);
    }

    fn classify(&self, host: &FakeHost, filter: &IgnoreFilter) -> Vec<ChangeRecord> {
        ChangeClassifier::new(host, &self.upper, &self.host, filter)
            .classify()
            .expect("classification failed")
    }

    fn commit(&self, records: &[ChangeRecord], filter: &IgnoreFilter) {
        let report = CommitEngine::new(&self.upper, &self.host, filter).commit(records);
        assert!(report.is_success(), "commit failed: {:?}", report.failures);
    }
}

fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("failed to create parent");
    }
    fs::write(path, contents).expect("failed to write file");
}

// =============================================================================
// Classification
// =============================================================================

#[test]
fn test_classification_is_idempotent() {
    let trees = Trees::new();
    let host = FakeHost::new();
    trees.write_host("/data/existing", "old");
    trees.write_upper("/data/existing", "new");
    trees.write_upper("/data/new/file", "x");
    trees.write_upper("/data/gone", "");
    host.mark_whiteout(trees.upper_path("/data/gone"));

    let filter = IgnoreFilter::empty();
    let first = trees.classify(&host, &filter);
    let second = trees.classify(&host, &filter);

    assert_eq!(first, second);
    assert_eq!(
        first,
        vec![
            ChangeRecord::new(ChangeKind::Modified, "/data/existing"),
            ChangeRecord::new(ChangeKind::Deleted, "/data/gone"),
            ChangeRecord::new(ChangeKind::DirCreated, "/data/new"),
            ChangeRecord::new(ChangeKind::Added, "/data/new/file"),
        ]
    );
}

#[test]
fn test_unchanged_directory_yields_nothing() {
    let trees = Trees::new();
    fs::set_permissions(trees.upper_path("/data"), fs::Permissions::from_mode(0o700))
        .expect("chmod");
    fs::set_permissions(trees.host_path("/data"), fs::Permissions::from_mode(0o755))
        .expect("chmod");

    let records = trees.classify(&FakeHost::new(), &IgnoreFilter::empty());
    assert!(records.is_empty(), "unexpected records: {records:?}");
}

#[test]
fn test_change_list_survives_the_changes_file() {
    let trees = Trees::new();
    trees.write_upper("/data/a file with spaces", "x");
    let records = trees.classify(&FakeHost::new(), &IgnoreFilter::empty());

    let file = trees.upper.parent().expect("parent").join("changes");
    write_records(&file, &records).expect("write changes");
    assert_eq!(
        fs::read_to_string(&file).expect("read changes"),
        "ad /data/a file with spaces\n"
    );
    assert_eq!(read_records(&file).expect("read records"), records);
}

// =============================================================================
// Round trips
// =============================================================================

#[test]
fn test_round_trip_add() {
    let trees = Trees::new();
    let host = FakeHost::new();
    trees.write_upper("/data/new.txt", "Hello World!\n");

    let filter = IgnoreFilter::empty();
    let records = trees.classify(&host, &filter);
    assert_eq!(records, vec![ChangeRecord::new(ChangeKind::Added, "/data/new.txt")]);

    trees.commit(&records, &filter);
    assert_eq!(
        fs::read_to_string(trees.host_path("/data/new.txt")).expect("read committed file"),
        "Hello World!\n"
    );
    assert!(trees.classify(&host, &filter).is_empty());
}

#[test]
fn test_round_trip_delete() {
    let trees = Trees::new();
    let host = FakeHost::new();
    trees.write_host("/data/old.txt", "bye");
    trees.write_upper("/data/old.txt", "");
    host.mark_whiteout(trees.upper_path("/data/old.txt"));

    let filter = IgnoreFilter::empty();
    let records = trees.classify(&host, &filter);
    assert_eq!(records, vec![ChangeRecord::new(ChangeKind::Deleted, "/data/old.txt")]);

    trees.commit(&records, &filter);
    assert!(!trees.host_path("/data/old.txt").exists());
}

#[test]
fn test_modified_file_replaces_host_contents() {
    let trees = Trees::new();
    trees.write_host("/data/app.conf", "port=80\n");
    trees.write_upper("/data/app.conf", "port=8080\n");

    let filter = IgnoreFilter::empty();
    let records = trees.classify(&FakeHost::new(), &filter);
    trees.commit(&records, &filter);

    assert_eq!(
        fs::read_to_string(trees.host_path("/data/app.conf")).expect("read"),
        "port=8080\n"
    );
}

#[test]
fn test_opaque_directory_replaces_host_directory() {
    let trees = Trees::new();
    let host = FakeHost::new();
    trees.write_host("/data/cache/stale", "old");
    trees.write_upper("/data/cache/fresh", "new");
    host.mark_opaque(trees.upper_path("/data/cache"));

    let filter = IgnoreFilter::empty();
    let records = trees.classify(&host, &filter);
    assert_eq!(
        records,
        vec![
            ChangeRecord::new(ChangeKind::DirReplaced, "/data/cache"),
            ChangeRecord::new(ChangeKind::Added, "/data/cache/fresh"),
        ]
    );

    trees.commit(&records, &filter);
    assert!(!trees.host_path("/data/cache/stale").exists());
    assert_eq!(
        fs::read_to_string(trees.host_path("/data/cache/fresh")).expect("read"),
        "new"
    );
}

#[test]
fn test_symlink_is_recreated_on_host() {
    let trees = Trees::new();
    trees.write_host("/data/current", "plain file");
    symlink("releases/v2", trees.upper_path("/data/current")).expect("symlink");

    let filter = IgnoreFilter::empty();
    let records = trees.classify(&FakeHost::new(), &filter);
    assert_eq!(records, vec![ChangeRecord::new(ChangeKind::Symlink, "/data/current")]);

    trees.commit(&records, &filter);
    assert_eq!(
        fs::read_link(trees.host_path("/data/current")).expect("read link"),
        PathBuf::from("releases/v2")
    );
}

#[test]
fn test_commit_continues_after_a_failing_record() {
    let trees = Trees::new();
    trees.write_upper("/data/ok.txt", "ok");

    let records = vec![
        ChangeRecord::new(ChangeKind::Added, "/missing/parent/file"),
        ChangeRecord::new(ChangeKind::Added, "/data/ok.txt"),
    ];
    let report = CommitEngine::new(&trees.upper, &trees.host, &IgnoreFilter::empty())
        .commit(&records);

    assert_eq!(report.applied, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].record, records[0]);
    assert!(trees.host_path("/data/ok.txt").exists());
}

// =============================================================================
// Ignore filter
// =============================================================================

#[test]
fn test_ignored_paths_are_neither_reported_nor_committed() {
    let trees = Trees::new();
    trees.write_upper("/data/build.log", "noise");
    trees.write_upper("/data/result", "signal");

    let filter = IgnoreFilter::new(["\\.log$"]).expect("valid pattern");
    let records = trees.classify(&FakeHost::new(), &filter);
    assert_eq!(records, vec![ChangeRecord::new(ChangeKind::Added, "/data/result")]);

    // A stale list that still names the ignored path.
    let stale = vec![
        ChangeRecord::new(ChangeKind::Added, "/data/build.log"),
        ChangeRecord::new(ChangeKind::Added, "/data/result"),
    ];
    trees.commit(&stale, &filter);
    assert!(!trees.host_path("/data/build.log").exists());
    assert!(trees.host_path("/data/result").exists());
}
