#![forbid(unsafe_code)]

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::core::naming;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    WorkspaceCreation,
    PreHooks,
    AgentExecution,
    PostHooks,
    Finalization,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkspaceCreation => "workspace_creation",
            Self::PreHooks => "pre_hooks",
            Self::AgentExecution => "agent_execution",
            Self::PostHooks => "post_hooks",
            Self::Finalization => "finalization",
        }
    }
}

/// One unit of orchestrated agent work (a "run").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub status: TaskStatus,
    pub phase: Phase,
    /// Empty until the workspace has been created.
    #[serde(default)]
    pub workspace_path: String,
    #[serde(default)]
    pub base_branch: String,
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub skill_id: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub total_subtasks: u32,
    #[serde(default)]
    pub completed_subtasks: u32,
    #[serde(default)]
    pub progress_percent: u8,
    /// The last turn ended normally and the conversation can be resumed.
    #[serde(default)]
    pub ready_to_act: bool,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub completed_at: Option<String>,
    /// Snapshot taken once at the terminal transition.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub retain_workspace: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub name: Option<String>,
    pub prompt: String,
    pub base_branch: Option<String>,
    pub backend: Option<String>,
    pub skill_id: Option<String>,
    pub retain_workspace: bool,
}

impl Task {
    #[must_use]
    pub fn new(fields: NewTask) -> Self {
        let now = now_rfc3339();
        Self {
            id: new_id(),
            name: fields.name.filter(|n| !n.trim().is_empty()),
            status: TaskStatus::Queued,
            phase: Phase::WorkspaceCreation,
            workspace_path: String::new(),
            base_branch: fields.base_branch.unwrap_or_default(),
            backend: fields.backend.unwrap_or_default(),
            session_id: None,
            skill_id: fields.skill_id,
            prompt: fields.prompt,
            total_subtasks: 0,
            completed_subtasks: 0,
            progress_percent: 0,
            ready_to_act: false,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
            duration_ms: None,
            retain_workspace: fields.retain_workspace,
            last_error: None,
        }
    }

    #[must_use]
    pub fn short_id(&self) -> String {
        naming::short_id(&self.id)
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        if let Some(name) = self.name.as_deref()
            && !name.trim().is_empty()
        {
            return name.to_owned();
        }
        if !self.prompt.trim().is_empty() {
            return truncate(self.prompt.trim(), 60);
        }
        self.short_id()
    }

    /// Waiting on a live process: running and not yet handed back to the user.
    #[must_use]
    pub fn is_executing(&self) -> bool {
        self.status == TaskStatus::Running && !self.ready_to_act
    }
}

/// Partial update of a [`Task`]. `None` leaves a field untouched; nullable
/// fields use `Some(None)` to clear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub name: Option<Option<String>>,
    pub status: Option<TaskStatus>,
    pub phase: Option<Phase>,
    pub workspace_path: Option<String>,
    pub base_branch: Option<String>,
    pub backend: Option<String>,
    pub session_id: Option<Option<String>>,
    pub prompt: Option<String>,
    pub total_subtasks: Option<u32>,
    pub completed_subtasks: Option<u32>,
    pub progress_percent: Option<u8>,
    pub ready_to_act: Option<bool>,
    pub completed_at: Option<Option<String>>,
    pub duration_ms: Option<Option<u64>>,
    pub retain_workspace: Option<bool>,
    pub last_error: Option<Option<String>>,
}

impl TaskPatch {
    /// Terminal transition: stamps completion time and the duration snapshot.
    #[must_use]
    pub fn finish(status: TaskStatus, created_at: &str) -> Self {
        let now = OffsetDateTime::now_utc();
        let duration_ms = parse_rfc3339(created_at).map(|start| {
            let ms = (now - start).whole_milliseconds().max(0);
            u64::try_from(ms).unwrap_or(u64::MAX)
        });
        Self {
            status: Some(status),
            phase: Some(Phase::Finalization),
            ready_to_act: Some(false),
            completed_at: Some(Some(format_rfc3339(now))),
            duration_ms: Some(duration_ms),
            ..Self::default()
        }
    }

    pub fn apply(self, task: &mut Task) {
        if let Some(v) = self.name {
            task.name = v;
        }
        if let Some(v) = self.status {
            task.status = v;
        }
        if let Some(v) = self.phase {
            task.phase = v;
        }
        if let Some(v) = self.workspace_path {
            task.workspace_path = v;
        }
        if let Some(v) = self.base_branch {
            task.base_branch = v;
        }
        if let Some(v) = self.backend {
            task.backend = v;
        }
        if let Some(v) = self.session_id {
            task.session_id = v;
        }
        if let Some(v) = self.prompt {
            task.prompt = v;
        }
        if let Some(v) = self.total_subtasks {
            task.total_subtasks = v;
        }
        if let Some(v) = self.completed_subtasks {
            task.completed_subtasks = v;
        }
        if let Some(v) = self.progress_percent {
            task.progress_percent = v.min(100);
        }
        if let Some(v) = self.ready_to_act {
            task.ready_to_act = v;
        }
        if let Some(v) = self.completed_at {
            task.completed_at = v;
        }
        if let Some(v) = self.duration_ms {
            task.duration_ms = v;
        }
        if let Some(v) = self.retain_workspace {
            task.retain_workspace = v;
        }
        if let Some(v) = self.last_error {
            task.last_error = v;
        }
        task.updated_at = now_rfc3339();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub task_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: String,
}

impl Message {
    #[must_use]
    pub fn new(task_id: &str, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            task_id: task_id.to_owned(),
            role,
            content: content.into(),
            created_at: now_rfc3339(),
        }
    }
}

/// An isolated working copy on its own branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workspace {
    pub id: String,
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub task_id: String,
    pub created_at: String,
    #[serde(default)]
    pub cleaned_up_at: Option<String>,
    #[serde(default)]
    pub retained: bool,
}

#[must_use]
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[must_use]
pub fn now_rfc3339() -> String {
    format_rfc3339(OffsetDateTime::now_utc())
}

fn format_rfc3339(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_else(|_| "unknown".to_owned())
}

#[must_use]
pub fn parse_rfc3339(s: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339).ok()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_owned();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
