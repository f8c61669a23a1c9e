#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::error::OrchError;

/// Synchronous wrapper over the `git` CLI, rooted at the main repository.
#[derive(Debug, Clone)]
pub struct Git {
    repo_root: PathBuf,
}

impl Git {
    pub fn from_cwd() -> Result<Self, OrchError> {
        let cwd = std::env::current_dir()
            .map_err(|e| OrchError::Other(format!("failed to get cwd: {e}")))?;
        Self::from_dir(&cwd)
    }

    pub fn from_dir(dir: &Path) -> Result<Self, OrchError> {
        let repo_root = find_repo_root(dir).ok_or(OrchError::NotInGitRepo)?;
        Ok(Self { repo_root })
    }

    #[must_use]
    pub fn new(repo_root: PathBuf) -> Self {
        Self { repo_root }
    }

    #[must_use]
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn list_worktrees_porcelain(&self) -> Result<String, OrchError> {
        self.run(&["worktree", "list", "--porcelain"])
    }

    /// `git worktree add -b <branch> <path> [<base>]`
    pub fn add_worktree(&self, path: &Path, branch: &str, base: &str) -> Result<(), OrchError> {
        let path = path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "add", "-b", branch, path.as_str()];
        if !base.trim().is_empty() {
            args.push(base);
        }
        self.run(&args).map(drop)
    }

    pub fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), OrchError> {
        let path = path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path.as_str());
        self.run(&args).map(drop)
    }

    pub fn prune_worktrees(&self) -> Result<(), OrchError> {
        self.run(&["worktree", "prune"]).map(drop)
    }

    pub fn delete_branch(&self, branch: &str) -> Result<(), OrchError> {
        self.run(&["branch", "-D", branch]).map(drop)
    }

    /// Branch checked out in `dir` (`HEAD` when detached).
    pub fn current_branch(&self, dir: &Path) -> Result<String, OrchError> {
        let out = self.run_in_dir(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok(out.trim().to_owned())
    }

    /// Top level of the working copy containing `dir`.
    pub fn toplevel(&self, dir: &Path) -> Result<PathBuf, OrchError> {
        let out = self.run_in_dir(dir, &["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    pub fn run(&self, args: &[&str]) -> Result<String, OrchError> {
        self.run_in_dir(&self.repo_root, args)
    }

    pub fn run_in_dir(&self, dir: &Path, args: &[&str]) -> Result<String, OrchError> {
        let out = exec(dir, args)?;
        if out.status.success() {
            return Ok(String::from_utf8_lossy(&out.stdout).to_string());
        }
        Err(OrchError::GitCommand {
            args: args.join(" "),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
        })
    }
}

fn exec(dir: &Path, args: &[&str]) -> Result<Output, OrchError> {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => OrchError::GitNotFound,
            _ => OrchError::Other(format!("failed to run git: {e}")),
        })
}

fn find_repo_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| {
            let candidate = dir.join(".git");
            candidate.is_dir() || candidate.is_file()
        })
        .map(Path::to_path_buf)
}
