//! End-to-end review scenarios.
//!
//! The command's effect on the upper layer is written by hand, as the kernel
//! overlay would leave it, and the rest of the pipeline runs for real against
//! a temporary host root.

use std::fs;
use std::path::{Path, PathBuf};

use cowrun::changes::{ChangeKind, ChangeRecord, read_records};
use cowrun::config::{Mode, RunConfig};
use cowrun::pipeline::{Answer, Pipeline};
use cowrun::sandbox::host::fake::FakeHost;
use cowrun::workspace::Workspace;
use tempfile::TempDir;

/// Host root with `/tmp/file.txt.gz`, and a scratch directory for workspaces.
struct Scene {
    host_root: PathBuf,
    scratch: PathBuf,
    _dir: TempDir,
}

impl Scene {
    fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let base = dir.path().canonicalize().expect("canonical temp dir");
        let host_root = base.join("root");
        let scratch = base.join("scratch");
        fs::create_dir_all(host_root.join("tmp")).expect("failed to create host tmp");
        fs::create_dir(&scratch).expect("failed to create scratch dir");
        fs::write(host_root.join("tmp/file.txt.gz"), b"\x1f\x8b compressed").expect("write gz");
        Self {
            host_root,
            scratch,
            _dir: dir,
        }
    }

    fn config(&self, mode: Mode) -> RunConfig {
        RunConfig::new("scene")
            .with_mode(mode)
            .with_host_root(&self.host_root)
            .with_scratch_dir(&self.scratch)
            .with_working_dir("/tmp")
    }

    fn workspace(&self) -> Workspace {
        Workspace::acquire(None, &self.scratch, "scene").expect("acquire workspace")
    }

    fn workspace_root(&self) -> PathBuf {
        self.scratch.join("cowrun-scene")
    }

    fn host(&self, path: &str) -> PathBuf {
        self.host_root.join(path.trim_start_matches('/'))
    }
}

/// Writes a file into the workspace's upper layer.
fn write_upper(workspace: &Workspace, path: &str, contents: &str) -> PathBuf {
    let file = workspace.paths().upper_for(Path::new(path));
    fs::create_dir_all(file.parent().expect("parent")).expect("failed to create upper dir");
    fs::write(&file, contents).expect("failed to write upper file");
    file
}

/// Leaves a whiteout for `path`, as `rm` inside the sandbox would.
fn delete_in_upper(host: &FakeHost, workspace: &Workspace, path: &str) {
    let marker = write_upper(workspace, path, "");
    host.mark_whiteout(marker);
}

/// `touch file_1.txt; echo test > file_2.txt; rm file.txt.gz` in `/tmp`.
fn scenario_a(host: &FakeHost, workspace: &Workspace) {
    write_upper(workspace, "/tmp/file_1.txt", "");
    write_upper(workspace, "/tmp/file_2.txt", "test\n");
    delete_in_upper(host, workspace, "/tmp/file.txt.gz");
}

/// `gunzip file.txt.gz` in `/tmp`.
fn scenario_b(host: &FakeHost, workspace: &Workspace) {
    write_upper(workspace, "/tmp/file.txt", "Hello World!\n");
    delete_in_upper(host, workspace, "/tmp/file.txt.gz");
}

fn review(
    host: &FakeHost,
    config: &RunConfig,
    workspace: Workspace,
    answer: Answer,
) -> (i32, String) {
    let filter = workspace.ignore_filter(&[]).expect("ignore filter");
    let mut out = Vec::new();
    let mut prompt = |_: &str| answer;
    let code = Pipeline::new(host, config)
        .review(workspace, &filter, 0, &mut out, &mut prompt)
        .expect("review failed");
    (code, String::from_utf8(out).expect("utf-8 output"))
}

#[test]
fn test_scenario_a_show_lists_changes_and_keeps_workspace() {
    let scene = Scene::new();
    let host = FakeHost::new();
    let workspace = scene.workspace();
    scenario_a(&host, &workspace);
    let changes_file = workspace.paths().changes_file.clone();

    let (code, out) = review(&host, &scene.config(Mode::Show), workspace, Answer::No);

    assert_eq!(code, 0);
    assert_eq!(
        out,
        format!(
            "Changes detected in the following files:\n\n\
             /tmp/file.txt.gz (deleted)\n\
             /tmp/file_1.txt (added)\n\
             /tmp/file_2.txt (added)\n\
             {}\n",
            scene.workspace_root().display()
        )
    );
    assert_eq!(
        read_records(&changes_file).expect("read changes"),
        vec![
            ChangeRecord::new(ChangeKind::Deleted, "/tmp/file.txt.gz"),
            ChangeRecord::new(ChangeKind::Added, "/tmp/file_1.txt"),
            ChangeRecord::new(ChangeKind::Added, "/tmp/file_2.txt"),
        ]
    );
    assert!(scene.host("/tmp/file.txt.gz").exists(), "host must be untouched");
    assert!(!scene.host("/tmp/file_1.txt").exists(), "host must be untouched");
}

#[test]
fn test_scenario_a_auto_commit_applies_to_host() {
    let scene = Scene::new();
    let host = FakeHost::new();
    let workspace = scene.workspace();
    scenario_a(&host, &workspace);

    let (code, _) = review(&host, &scene.config(Mode::AutoCommit), workspace, Answer::No);

    assert_eq!(code, 0);
    assert_eq!(fs::read_to_string(scene.host("/tmp/file_1.txt")).expect("read"), "");
    assert_eq!(fs::read_to_string(scene.host("/tmp/file_2.txt")).expect("read"), "test\n");
    assert!(!scene.host("/tmp/file.txt.gz").exists());
}

#[test]
fn test_scenario_b_auto_commit_applies_to_host() {
    let scene = Scene::new();
    let host = FakeHost::new();
    let workspace = scene.workspace();
    scenario_b(&host, &workspace);

    let (code, _) = review(&host, &scene.config(Mode::AutoCommit), workspace, Answer::No);

    assert_eq!(code, 0);
    assert_eq!(
        fs::read_to_string(scene.host("/tmp/file.txt")).expect("read committed file"),
        "Hello World!\n"
    );
    assert!(!scene.host("/tmp/file.txt.gz").exists());
    assert!(!scene.workspace_root().exists(), "workspace must be released");
}

#[test]
fn test_interactive_yes_commits() {
    let scene = Scene::new();
    let host = FakeHost::new();
    let workspace = scene.workspace();
    scenario_b(&host, &workspace);

    let (code, out) = review(&host, &scene.config(Mode::Interactive), workspace, Answer::Yes);

    assert_eq!(code, 0);
    assert!(out.starts_with("Changes detected in the following files:"));
    assert!(scene.host("/tmp/file.txt").exists());
    assert!(!scene.workspace_root().exists());
}

#[test]
fn test_interactive_no_discards() {
    let scene = Scene::new();
    let host = FakeHost::new();
    let workspace = scene.workspace();
    scenario_b(&host, &workspace);

    let (code, _) = review(&host, &scene.config(Mode::Interactive), workspace, Answer::No);

    assert_eq!(code, 0);
    assert!(!scene.host("/tmp/file.txt").exists());
    assert!(scene.host("/tmp/file.txt.gz").exists());
    assert!(!scene.workspace_root().exists());
}

#[test]
fn test_interrupted_prompt_discards_with_signal_status() {
    let scene = Scene::new();
    let host = FakeHost::new();
    let workspace = scene.workspace();
    scenario_b(&host, &workspace);

    let (code, _) = review(
        &host,
        &scene.config(Mode::Interactive),
        workspace,
        Answer::Interrupted(libc::SIGINT),
    );

    assert_eq!(code, 130);
    assert!(!scene.host("/tmp/file.txt").exists());
    assert!(!scene.workspace_root().exists());
}

#[test]
fn test_quiet_prints_only_workspace_path() {
    let scene = Scene::new();
    let host = FakeHost::new();
    let workspace = scene.workspace();
    scenario_a(&host, &workspace);

    let (code, out) = review(&host, &scene.config(Mode::Quiet), workspace, Answer::Yes);

    assert_eq!(code, 0);
    assert_eq!(out, format!("{}\n", scene.workspace_root().display()));
    assert!(scene.workspace_root().join("upperdir/tmp/file_2.txt").exists());
}

#[test]
fn test_no_changes_discards_workspace() {
    let scene = Scene::new();
    let host = FakeHost::new();
    let workspace = scene.workspace();

    let (code, out) = review(&host, &scene.config(Mode::Show), workspace, Answer::Yes);

    assert_eq!(code, 0);
    assert_eq!(out, "No changes detected\n");
    assert!(!scene.workspace_root().exists());
}

#[test]
fn test_quiet_keeps_workspace_without_changes() {
    let scene = Scene::new();
    let host = FakeHost::new();
    let workspace = scene.workspace();

    let (code, out) = review(&host, &scene.config(Mode::Quiet), workspace, Answer::Yes);

    assert_eq!(code, 0);
    assert_eq!(out, format!("{}\n", scene.workspace_root().display()));
    assert!(scene.workspace_root().join("upperdir").is_dir());

    let config = scene.config(Mode::Quiet);
    let mut out = Vec::new();
    let code = Pipeline::new(&host, &config)
        .summary(&scene.workspace_root(), &mut out)
        .expect("summary of the kept workspace");
    assert_eq!(code, 0);
}

#[test]
fn test_summary_and_commit_on_kept_workspace() {
    let scene = Scene::new();
    let host = FakeHost::new();
    let workspace = scene.workspace();
    scenario_b(&host, &workspace);
    let config = scene.config(Mode::Quiet);
    review(&host, &config, workspace, Answer::No);

    let pipeline = Pipeline::new(&host, &config);
    let mut out = Vec::new();
    let code = pipeline
        .summary(&scene.workspace_root(), &mut out)
        .expect("summary");
    assert_eq!(code, 0);
    assert_eq!(
        String::from_utf8(out).expect("utf-8 output"),
        "Changes detected in the following files:\n\n\
         /tmp/file.txt (added)\n\
         /tmp/file.txt.gz (deleted)\n"
    );

    let mut out = Vec::new();
    let code = pipeline
        .commit(&scene.workspace_root(), &mut out)
        .expect("commit");
    assert_eq!(code, 0);
    assert!(scene.host("/tmp/file.txt").exists());
    assert!(!scene.host("/tmp/file.txt.gz").exists());
    assert!(scene.workspace_root().exists(), "explicit workspaces are kept");
}
