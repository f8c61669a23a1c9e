#![forbid(unsafe_code)]

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchError {
    #[error("not inside a git repository")]
    NotInGitRepo,

    #[error("git is required but was not found in PATH")]
    GitNotFound,

    #[error("git {args}: {stderr}")]
    GitCommand { args: String, stderr: String },

    #[error("{backend} executable '{executable}' was not found or is not executable")]
    BackendNotFound { backend: String, executable: String },

    #[error("unknown agent backend '{0}' (expected claude|codex)")]
    UnknownBackend(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("an agent process is already running for task {0}")]
    AlreadyRunning(String),

    #[error("failed to create workspace for branch {branch}: {msg}")]
    WorkspaceCreate { branch: String, msg: String },

    #[error("failed to remove workspace {path}: {msg}")]
    WorkspaceRemove { path: PathBuf, msg: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid config key '{0}'")]
    InvalidConfigKey(String),

    #[error("invalid config value for '{key}': {msg}")]
    InvalidConfigValue { key: String, msg: String },

    #[error("io error at {path}: {source}")]
    IoPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl OrchError {
    /// True when git refused because a branch or worktree path already exists.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::GitCommand { stderr, .. } => stderr.contains("already exists"),
            Self::WorkspaceCreate { msg, .. } => msg.contains("already exists"),
            _ => false,
        }
    }
}
