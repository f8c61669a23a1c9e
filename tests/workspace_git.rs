use std::path::Path;
use std::process::Command;

use agent_orch::core::git::Git;
use agent_orch::core::workspace::WorkspaceManager;

const TASK_ID: &str = "3f9a1c2be4d54f0a9c1d2e3f4a5b6c7d";

fn git_available() -> bool {
    Command::new("git").arg("--version").output().is_ok()
}

fn init_repo(dir: &Path) {
    std::fs::create_dir_all(dir).expect("mkdir repo");
    run(dir, &["init"]);
    run(dir, &["config", "user.email", "test@example.com"]);
    run(dir, &["config", "user.name", "Test"]);
    std::fs::write(dir.join("README.md"), "hello\n").expect("write");
    run(dir, &["add", "."]);
    run(dir, &["commit", "-m", "init"]);
    run(dir, &["branch", "-M", "main"]);
}

fn run(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git command");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

#[test]
fn create_recover_and_remove_workspace() {
    if !git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let repo = td.path().join("repo");
    init_repo(&repo);

    let git = Git::from_dir(&repo).expect("git from dir");
    let wm = WorkspaceManager::new(git.clone(), td.path().join("workspaces"));

    let ws = wm.create("main", "agent-orch", TASK_ID).expect("create");
    assert_eq!(ws.branch, "agent-orch-3f9a1c2b");
    assert_eq!(ws.path, td.path().join("workspaces").join("agent-orch-3f9a1c2b"));
    assert!(ws.path.join("README.md").is_file());
    assert_eq!(git.current_branch(&ws.path).unwrap(), "agent-orch-3f9a1c2b");

    let listed = wm.list().expect("list");
    assert!(listed.iter().any(|e| e.branch == "agent-orch-3f9a1c2b"));

    assert_eq!(wm.resolve("", TASK_ID), Some(ws.path.clone()));
    assert_eq!(wm.resolve("/gone/elsewhere", TASK_ID), Some(ws.path.clone()));

    wm.remove(Path::new("agent-orch-3f9a1c2b")).expect("remove");
    assert!(!ws.path.exists());
    assert!(wm.remove(&ws.path).is_err());
    assert_eq!(wm.resolve("", TASK_ID), None);
}

#[test]
fn stale_workspace_is_replaced_on_create() {
    if !git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let repo = td.path().join("repo");
    init_repo(&repo);

    let git = Git::from_dir(&repo).expect("git from dir");
    let wm = WorkspaceManager::new(git.clone(), td.path().join("workspaces"));

    let first = wm.create("main", "agent-orch", TASK_ID).expect("first create");
    std::fs::write(first.path.join("leftover.txt"), "partial run").expect("write");

    let second = wm.create("main", "agent-orch", TASK_ID).expect("retry create");
    assert_eq!(second.path, first.path);
    assert!(!second.path.join("leftover.txt").exists());
    assert_eq!(git.current_branch(&second.path).unwrap(), "agent-orch-3f9a1c2b");
}

#[test]
fn unknown_base_branch_fails_creation() {
    if !git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let repo = td.path().join("repo");
    init_repo(&repo);

    let wm = WorkspaceManager::new(
        Git::from_dir(&repo).expect("git from dir"),
        td.path().join("workspaces"),
    );
    let err = wm
        .create("no-such-branch", "agent-orch", TASK_ID)
        .unwrap_err();
    assert!(err.to_string().contains("agent-orch-3f9a1c2b"), "{err}");
}
