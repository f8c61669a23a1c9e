#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::core::git::Git;
use crate::core::naming;
use crate::error::OrchError;
use crate::task::model::{Workspace, new_id, now_rfc3339};

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: String,
    pub head: String,
}

/// Creates, recovers and removes per-task worktrees under one root directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    git: Git,
    root: PathBuf,
}

impl WorkspaceManager {
    #[must_use]
    pub fn new(git: Git, root: PathBuf) -> Self {
        Self { git, root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a worktree on a new branch `{prefix}-{id8}` pointed at
    /// `base_branch`. A leftover worktree or branch from an earlier partial
    /// run is force-removed and creation retried once.
    pub fn create(
        &self,
        base_branch: &str,
        branch_prefix: &str,
        task_id: &str,
    ) -> Result<Workspace, OrchError> {
        std::fs::create_dir_all(&self.root).map_err(|e| OrchError::IoPath {
            path: self.root.clone(),
            source: e,
        })?;

        let branch = naming::branch_name(branch_prefix, task_id);
        let path = self.root.join(&branch);

        match self.git.add_worktree(&path, &branch, base_branch) {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                warn!(%branch, path = %path.display(), error = %e, "stale workspace found, recreating");
                self.clear_stale(&path, &branch);
                self.git
                    .add_worktree(&path, &branch, base_branch)
                    .map_err(|e| OrchError::WorkspaceCreate {
                        branch: branch.clone(),
                        msg: e.to_string(),
                    })?;
            }
            Err(OrchError::GitNotFound) => return Err(OrchError::GitNotFound),
            Err(e) => {
                return Err(OrchError::WorkspaceCreate {
                    branch,
                    msg: e.to_string(),
                });
            }
        }

        self.verify(&path, &branch);
        info!(task_id, %branch, path = %path.display(), "workspace created");

        Ok(Workspace {
            id: new_id(),
            path,
            branch,
            base_branch: base_branch.to_owned(),
            task_id: task_id.to_owned(),
            created_at: now_rfc3339(),
            cleaned_up_at: None,
            retained: false,
        })
    }

    /// Force-remove a workspace given an absolute or root-relative path.
    pub fn remove(&self, path: &Path) -> Result<(), OrchError> {
        let path = self.absolutize(path);
        if let Err(e) = self.git.remove_worktree(&path, true) {
            warn!(path = %path.display(), error = %e, "failed to remove workspace");
            return Err(OrchError::WorkspaceRemove {
                path,
                msg: e.to_string(),
            });
        }
        if let Err(e) = self.git.prune_worktrees() {
            debug!(error = %e, "worktree prune failed");
        }
        info!(path = %path.display(), "workspace removed");
        Ok(())
    }

    /// Scan the root for a directory whose name contains the task's short id.
    ///
    /// Substring matching on eight characters can in principle collide
    /// between tasks; the first match in name order wins.
    #[must_use]
    pub fn find_for_task(&self, task_id: &str) -> Option<PathBuf> {
        find_workspace_dir(&self.root, task_id)
    }

    /// The workspace to use for a task: the stored path when it still points
    /// at a directory, otherwise whatever [`Self::find_for_task`] recovers.
    #[must_use]
    pub fn resolve(&self, stored_path: &str, task_id: &str) -> Option<PathBuf> {
        if !naming::is_placeholder_path(stored_path) {
            let p = self.absolutize(Path::new(stored_path.trim()));
            if p.is_dir() {
                return Some(p);
            }
            debug!(task_id, path = %p.display(), "stored workspace path is stale");
        }
        let found = self.find_for_task(task_id);
        if let Some(p) = &found {
            info!(task_id, path = %p.display(), "recovered workspace by directory search");
        }
        found
    }

    pub fn list(&self) -> Result<Vec<WorktreeEntry>, OrchError> {
        let out = self.git.list_worktrees_porcelain()?;
        Ok(parse_worktree_porcelain(&out))
    }

    fn absolutize(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn clear_stale(&self, path: &Path, branch: &str) {
        if let Ok(entries) = self.list() {
            for entry in entries.iter().filter(|e| e.branch == branch) {
                if let Err(e) = self.git.remove_worktree(&entry.path, true) {
                    debug!(path = %entry.path.display(), error = %e, "stale worktree removal failed");
                }
            }
        }
        if path.exists() {
            let _ = self.git.remove_worktree(path, true);
            if path.exists()
                && let Err(e) = std::fs::remove_dir_all(path)
            {
                warn!(path = %path.display(), error = %e, "failed to delete stale workspace directory");
            }
        }
        let _ = self.git.prune_worktrees();
        if let Err(e) = self.git.delete_branch(branch) {
            debug!(%branch, error = %e, "stale branch not deleted");
        }
    }

    // Mismatches are only logged; some environments report symlinked or
    // differently-cased paths for the same directory.
    fn verify(&self, path: &Path, branch: &str) {
        match self.git.current_branch(path) {
            Ok(actual) if actual == branch => {}
            Ok(actual) => warn!(expected = %branch, %actual, "workspace is on an unexpected branch"),
            Err(e) => warn!(error = %e, "could not read workspace branch"),
        }
        match self.git.toplevel(path) {
            Ok(top) if same_dir(&top, path) => {}
            Ok(top) => warn!(
                path = %path.display(),
                toplevel = %top.display(),
                "workspace does not resolve to its own repository root"
            ),
            Err(e) => warn!(error = %e, "could not read workspace toplevel"),
        }
    }
}

/// Recovery-by-search without a [`WorkspaceManager`]: first directory under
/// `root` (in name order) whose name contains the first eight characters of
/// `task_id`.
#[must_use]
pub fn find_workspace_dir(root: &Path, task_id: &str) -> Option<PathBuf> {
    let needle = naming::short_id(task_id.trim());
    if needle.is_empty() {
        return None;
    }
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(root)
        .ok()?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
        .filter(|entry| entry.file_name().to_string_lossy().contains(&needle))
        .map(|entry| entry.path())
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn parse_worktree_porcelain(out: &str) -> Vec<WorktreeEntry> {
    let mut entries: Vec<WorktreeEntry> = Vec::new();
    let mut cur: Option<WorktreeEntry> = None;

    for line in out.lines() {
        let line = line.trim_end();
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.extend(cur.take());
            cur = Some(WorktreeEntry {
                path: PathBuf::from(path),
                branch: String::new(),
                head: String::new(),
            });
        } else if let Some(entry) = cur.as_mut() {
            if let Some(branch) = line.strip_prefix("branch ") {
                branch
                    .trim()
                    .trim_start_matches("refs/heads/")
                    .clone_into(&mut entry.branch);
            } else if let Some(head) = line.strip_prefix("HEAD ") {
                head.trim().clone_into(&mut entry.head);
            }
        }
    }
    entries.extend(cur);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worktree_list_porcelain() {
        let out = r#"worktree /repo
HEAD 1111111111111111111111111111111111111111
branch refs/heads/main

worktree /ws/agent-orch-3f9a1c2b
HEAD 2222222222222222222222222222222222222222
branch refs/heads/agent-orch-3f9a1c2b

worktree /ws/detached
HEAD 3333333333333333333333333333333333333333
detached
"#;

        let entries = parse_worktree_porcelain(out);
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[0],
            WorktreeEntry {
                path: PathBuf::from("/repo"),
                branch: "main".to_owned(),
                head: "1111111111111111111111111111111111111111".to_owned(),
            }
        );
        assert_eq!(entries[1].branch, "agent-orch-3f9a1c2b");
        assert_eq!(entries[2].branch, "");
    }

    #[test]
    fn recovers_workspace_by_short_id() {
        let td = tempfile::tempdir().expect("tempdir");
        let root = td.path().join("workspaces");
        std::fs::create_dir_all(root.join("agent-orch-aaaaaaaa")).unwrap();
        std::fs::create_dir_all(root.join("custom-3f9a1c2b")).unwrap();
        std::fs::write(root.join("3f9a1c2b.txt"), "not a dir").unwrap();

        let wm = WorkspaceManager::new(Git::new(td.path().to_path_buf()), root.clone());
        let task_id = "3f9a1c2be4d54f0a9c1d2e3f4a5b6c7d";

        assert_eq!(wm.find_for_task(task_id), Some(root.join("custom-3f9a1c2b")));
        assert_eq!(wm.resolve("", task_id), Some(root.join("custom-3f9a1c2b")));
        assert_eq!(
            wm.resolve("/definitely/gone/agent-orch-3f9a1c2b", task_id),
            Some(root.join("custom-3f9a1c2b"))
        );
        assert_eq!(
            wm.resolve("agent-orch-aaaaaaaa", task_id),
            Some(root.join("agent-orch-aaaaaaaa"))
        );
        assert_eq!(wm.find_for_task("bbbbbbbb0000"), None);
        assert_eq!(find_workspace_dir(&td.path().join("missing"), task_id), None);
    }
}
