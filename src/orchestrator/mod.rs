#![forbid(unsafe_code)]

//! Task lifecycle: `queued -> running(ready=false) <-> running(ready=true)
//! -> completed | failed | cancelled`.

pub mod notify;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context as _;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agent::{
    self, AgentBackend, BackendKind, TurnEvent, TurnHandle, TurnRequest,
};
use crate::config::Config;
use crate::core::workspace::WorkspaceManager;
use crate::error::OrchError;
use crate::task::model::{Message, NewTask, Phase, Role, Task, TaskPatch, TaskStatus};
use crate::task::store::{Store, prefs};

pub use self::notify::Notifier;

/// Which backend owns a task's conversation, and which turn is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Instance {
    kind: BackendKind,
    turn: u64,
}

struct Inner {
    store: Arc<dyn Store>,
    workspaces: WorkspaceManager,
    config: Config,
    backends: Mutex<HashMap<BackendKind, Arc<dyn AgentBackend>>>,
    instances: Mutex<HashMap<String, Instance>>,
    starting: Mutex<HashSet<String>>,
    next_turn: AtomicU64,
    notifier: Notifier,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives tasks through their lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// Holds the per-task start lock until dropped.
struct StartGuard {
    inner: Arc<Inner>,
    task_id: String,
}

impl StartGuard {
    fn acquire(inner: &Arc<Inner>, task_id: &str) -> Option<Self> {
        lock(&inner.starting)
            .insert(task_id.to_owned())
            .then(|| Self {
                inner: Arc::clone(inner),
                task_id: task_id.to_owned(),
            })
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        lock(&self.inner.starting).remove(&self.task_id);
    }
}

impl Orchestrator {
    /// Must be called within a Tokio runtime (the notifier runs as a task).
    pub fn new(config: Config, store: Arc<dyn Store>, workspaces: WorkspaceManager) -> Self {
        let notifier = Notifier::spawn(
            config.orchestrator.notify_debounce(),
            config.orchestrator.notify_max_wait(),
        );
        Self {
            inner: Arc::new(Inner {
                store,
                workspaces,
                config,
                backends: Mutex::new(HashMap::new()),
                instances: Mutex::new(HashMap::new()),
                starting: Mutex::new(HashSet::new()),
                next_turn: AtomicU64::new(1),
                notifier,
            }),
        }
    }

    /// Use `backend` for its kind instead of the configured executable.
    #[must_use]
    pub fn with_backend(self, backend: Arc<dyn AgentBackend>) -> Self {
        lock(&self.inner.backends).insert(backend.kind(), backend);
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    #[must_use]
    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.inner.workspaces
    }

    /// Change pulses, debounced. Re-read task and message state on change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.notifier.subscribe()
    }

    pub fn create_task(&self, fields: NewTask) -> anyhow::Result<Task> {
        let backend = match fields.backend.as_deref().map(str::trim) {
            Some(b) if !b.is_empty() => b.parse::<BackendKind>()?,
            _ => self.default_backend(),
        };
        let base_branch = fields
            .base_branch
            .clone()
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| self.preference(prefs::BASE_BRANCH, &self.inner.config.workspace.base_branch));
        let task = Task::new(NewTask {
            backend: Some(backend.as_str().to_owned()),
            base_branch: Some(base_branch),
            ..fields
        });
        let task = self.inner.store.create_task(task)?;
        info!(task_id = %task.id, backend = %backend, "task created");
        self.notify();
        Ok(task)
    }

    /// Begin (or continue) work on a task.
    ///
    /// Re-entrant calls while a start is in flight, or while the task is
    /// mid-turn, are ignored with a warning. A task whose previous turn
    /// ended normally is resumed with its current prompt.
    pub async fn start(&self, task_id: &str, backend: Option<BackendKind>) -> anyhow::Result<()> {
        let Some(_guard) = StartGuard::acquire(&self.inner, task_id) else {
            warn!(%task_id, "start already in progress; ignoring");
            return Ok(());
        };
        let task = self.inner.store.require_task(task_id)?;

        if let Some(instance) = self.instance(task_id) {
            let live = self.backend(instance.kind);
            if live.is_waiting_for_input(task_id) {
                info!(%task_id, backend = %instance.kind, "session waiting for input; resuming");
                let prompt = task.prompt.clone();
                return self.resume_locked(&task, instance.kind, prompt).await;
            }
        }
        if task.is_executing() {
            warn!(%task_id, "task is already executing; ignoring start");
            return Ok(());
        }

        let kind = match backend {
            Some(kind) => kind,
            None => self.task_backend(&task),
        };
        self.update(
            task_id,
            TaskPatch {
                status: Some(TaskStatus::Running),
                phase: Some(Phase::WorkspaceCreation),
                ready_to_act: Some(false),
                backend: Some(kind.as_str().to_owned()),
                completed_at: Some(None),
                duration_ms: Some(None),
                last_error: Some(None),
                ..TaskPatch::default()
            },
        )?;

        match self.launch(&task, kind).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mark_failed(task_id, &format!("{e:#}"));
                Err(e)
            }
        }
    }

    /// Send follow-up text to a task's conversation.
    pub async fn send_message(&self, task_id: &str, text: &str) -> anyhow::Result<()> {
        let task = self.inner.store.require_task(task_id)?;

        let kind = match self.instance(task_id) {
            Some(instance) => {
                if self.backend(instance.kind).is_running(task_id) {
                    warn!(%task_id, "agent is mid-turn; message rejected");
                    return Ok(());
                }
                instance.kind
            }
            None => match self.adopt_persisted_session(&task) {
                Some(kind) => kind,
                None => {
                    if task.is_executing() {
                        warn!(%task_id, "task is already executing; message rejected");
                        return Ok(());
                    }
                    self.record_user_message(task_id, text)?;
                    self.update(
                        task_id,
                        TaskPatch {
                            prompt: Some(text.to_owned()),
                            ..TaskPatch::default()
                        },
                    )?;
                    return self.start(task_id, None).await;
                }
            },
        };

        let Some(_guard) = StartGuard::acquire(&self.inner, task_id) else {
            warn!(%task_id, "start already in progress; message rejected");
            return Ok(());
        };
        self.record_user_message(task_id, text)?;
        self.resume_locked(&task, kind, text.to_owned()).await
    }

    /// Cancel a task. Best effort: the process is signalled and the task
    /// marked cancelled without waiting for it to exit.
    pub fn stop(&self, task_id: &str) -> anyhow::Result<Task> {
        self.finish(task_id, TaskStatus::Cancelled, None)
    }

    /// Mark a task done by the user.
    pub fn complete(&self, task_id: &str) -> anyhow::Result<Task> {
        self.finish(task_id, TaskStatus::Completed, None)
    }

    pub fn fail(&self, task_id: &str, reason: &str) -> anyhow::Result<Task> {
        self.finish(task_id, TaskStatus::Failed, Some(reason))
    }

    /// Remove the task and its messages, then its workspace unless retained.
    /// A workspace removal error is returned after the row is already gone.
    pub async fn delete(&self, task_id: &str) -> anyhow::Result<()> {
        let task = self.inner.store.require_task(task_id)?;
        self.halt(task_id);
        self.inner.store.delete_task(task_id)?;
        info!(%task_id, "task deleted");
        self.notify();

        if task.retain_workspace {
            return Ok(());
        }
        let Some(path) = self
            .inner
            .workspaces
            .resolve(&task.workspace_path, &task.id)
        else {
            return Ok(());
        };
        let wm = self.inner.workspaces.clone();
        tokio::task::spawn_blocking(move || wm.remove(&path))
            .await
            .context("workspace removal task failed")??;
        Ok(())
    }

    /// Wait until the task is no longer mid-turn and return its final row.
    pub async fn wait_idle(&self, task_id: &str) -> anyhow::Result<Task> {
        let mut changes = self.subscribe();
        loop {
            let task = self.inner.store.require_task(task_id)?;
            let starting = lock(&self.inner.starting).contains(task_id);
            if !starting && !task.is_executing() {
                return Ok(task);
            }
            changes
                .changed()
                .await
                .context("change notifier stopped")?;
        }
    }

    #[must_use]
    pub fn is_running(&self, task_id: &str) -> bool {
        self.instance(task_id)
            .is_some_and(|i| self.backend(i.kind).is_running(task_id))
    }

    async fn launch(&self, task: &Task, kind: BackendKind) -> anyhow::Result<()> {
        let workspace = self.ensure_workspace(task).await?;
        self.update(
            &task.id,
            TaskPatch {
                phase: Some(Phase::AgentExecution),
                workspace_path: Some(workspace.to_string_lossy().into_owned()),
                ..TaskPatch::default()
            },
        )?;

        let backend = self.backend(kind);
        let request = TurnRequest {
            task_id: task.id.clone(),
            prompt: task.prompt.clone(),
            workspace,
        };
        self.dispatch(&task.id, kind, backend.run_turn(request))
    }

    async fn resume_locked(&self, task: &Task, kind: BackendKind, prompt: String) -> anyhow::Result<()> {
        let Some(workspace) = self
            .inner
            .workspaces
            .resolve(&task.workspace_path, &task.id)
        else {
            let reason = format!("workspace for task {} is missing", task.short_id());
            self.halt(&task.id);
            self.mark_failed(&task.id, &reason);
            anyhow::bail!(reason);
        };

        self.update(
            &task.id,
            TaskPatch {
                status: Some(TaskStatus::Running),
                phase: Some(Phase::AgentExecution),
                ready_to_act: Some(false),
                prompt: Some(prompt.clone()),
                workspace_path: Some(workspace.to_string_lossy().into_owned()),
                completed_at: Some(None),
                duration_ms: Some(None),
                last_error: Some(None),
                ..TaskPatch::default()
            },
        )?;

        let request = TurnRequest {
            task_id: task.id.clone(),
            prompt,
            workspace,
        };
        let result = self.backend(kind).resume_turn(request);
        self.dispatch(&task.id, kind, result).inspect_err(|e| {
            self.mark_failed(&task.id, &format!("{e:#}"));
        })
    }

    fn dispatch(
        &self,
        task_id: &str,
        kind: BackendKind,
        result: Result<TurnHandle, OrchError>,
    ) -> anyhow::Result<()> {
        let handle = match result {
            Ok(handle) => handle,
            Err(OrchError::AlreadyRunning(_)) => {
                warn!(%task_id, backend = %kind, "agent process already running; not dispatching");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let turn = self.inner.next_turn.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.instances).insert(task_id.to_owned(), Instance { kind, turn });
        self.notify();

        let this = self.clone();
        let task_id = task_id.to_owned();
        tokio::spawn(async move { this.drive(task_id, turn, handle).await });
        Ok(())
    }

    async fn drive(self, task_id: String, turn: u64, mut handle: TurnHandle) {
        let outcome = loop {
            match handle.next().await {
                Some(TurnEvent::Message(_)) => self.notify(),
                Some(TurnEvent::Completed) => break Ok(()),
                Some(TurnEvent::Failed(reason)) => break Err(reason),
                None => break Err("agent supervisor ended without a result".to_owned()),
            }
        };

        let current = self
            .instance(&task_id)
            .is_some_and(|i| i.turn == turn);
        if !current {
            debug!(%task_id, turn, "ignoring outcome of a superseded turn");
            return;
        }
        if let Err(e) = self.finish_turn(&task_id, outcome) {
            warn!(%task_id, error = %e, "failed to record turn outcome");
        }
        self.notify();
    }

    fn finish_turn(&self, task_id: &str, outcome: Result<(), String>) -> anyhow::Result<()> {
        if self.inner.store.get_task(task_id)?.is_none() {
            return Ok(());
        }
        match outcome {
            Ok(()) => {
                let patch = TaskPatch {
                    ready_to_act: Some(true),
                    ..TaskPatch::default()
                };
                let still_running = |t: &Task| t.status == TaskStatus::Running;
                match self
                    .inner
                    .store
                    .update_task_if(task_id, &still_running, patch)?
                {
                    Some(_) => info!(%task_id, "turn complete; ready for input"),
                    None => debug!(%task_id, "task already finished; turn outcome ignored"),
                }
                self.notify();
            }
            Err(reason) => {
                lock(&self.inner.instances).remove(task_id);
                self.mark_failed(task_id, &reason);
            }
        }
        Ok(())
    }

    fn finish(&self, task_id: &str, status: TaskStatus, reason: Option<&str>) -> anyhow::Result<Task> {
        let task = self.inner.store.require_task(task_id)?;
        self.halt(task_id);
        let mut patch = TaskPatch::finish(status, &task.created_at);
        if let Some(reason) = reason {
            patch.last_error = Some(Some(reason.to_owned()));
        }
        let task = self.update(task_id, patch)?;
        info!(%task_id, status = status.as_str(), "task finished");
        self.notify();
        Ok(task)
    }

    /// Signal any live process and drop the task's instance record.
    fn halt(&self, task_id: &str) {
        let removed = lock(&self.inner.instances).remove(task_id);
        if let Some(instance) = removed
            && self.backend(instance.kind).stop(task_id)
        {
            info!(%task_id, backend = %instance.kind, "agent process signalled");
        }
    }

    /// No-op once the task is terminal, so a late failure never replaces a
    /// cancel or a completion.
    fn mark_failed(&self, task_id: &str, reason: &str) {
        let Ok(Some(task)) = self.inner.store.get_task(task_id) else {
            return;
        };
        let mut patch = TaskPatch::finish(TaskStatus::Failed, &task.created_at);
        patch.session_id = Some(None);
        patch.last_error = Some(Some(reason.to_owned()));
        let active = |t: &Task| !t.status.is_terminal();
        match self.inner.store.update_task_if(task_id, &active, patch) {
            Ok(Some(_)) => warn!(%task_id, error = %reason, "task failed"),
            Ok(None) => debug!(%task_id, "task already finished; failure not recorded"),
            Err(e) => warn!(%task_id, error = %e, "failed to mark task failed"),
        }
        self.notify();
    }

    /// After a restart the backend registry is empty; a task that was
    /// waiting for input with a persisted session token can still resume.
    fn adopt_persisted_session(&self, task: &Task) -> Option<BackendKind> {
        if task.status != TaskStatus::Running || !task.ready_to_act {
            return None;
        }
        let session = task.session_id.as_deref()?;
        let workspace = self
            .inner
            .workspaces
            .resolve(&task.workspace_path, &task.id)?;
        let kind = self.task_backend(task);
        self.backend(kind).adopt_session(&task.id, session, workspace);
        let turn = self.inner.next_turn.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.instances).insert(task.id.clone(), Instance { kind, turn });
        info!(task_id = %task.id, backend = %kind, "adopted persisted session");
        Some(kind)
    }

    async fn ensure_workspace(&self, task: &Task) -> anyhow::Result<PathBuf> {
        if let Some(path) = self
            .inner
            .workspaces
            .resolve(&task.workspace_path, &task.id)
        {
            return Ok(path);
        }
        let base = if task.base_branch.trim().is_empty() {
            self.preference(prefs::BASE_BRANCH, &self.inner.config.workspace.base_branch)
        } else {
            task.base_branch.clone()
        };
        let prefix = self.preference(
            prefs::BRANCH_PREFIX,
            &self.inner.config.workspace.branch_prefix,
        );
        let wm = self.inner.workspaces.clone();
        let task_id = task.id.clone();
        let ws = tokio::task::spawn_blocking(move || wm.create(&base, &prefix, &task_id))
            .await
            .context("workspace creation task failed")??;
        Ok(ws.path)
    }

    fn record_user_message(&self, task_id: &str, text: &str) -> anyhow::Result<()> {
        self.inner
            .store
            .create_message(Message::new(task_id, Role::User, text))?;
        Ok(())
    }

    fn update(&self, task_id: &str, patch: TaskPatch) -> anyhow::Result<Task> {
        let task = self.inner.store.update_task(task_id, patch)?;
        self.notify();
        Ok(task)
    }

    fn instance(&self, task_id: &str) -> Option<Instance> {
        lock(&self.inner.instances).get(task_id).copied()
    }

    fn backend(&self, kind: BackendKind) -> Arc<dyn AgentBackend> {
        let mut backends = lock(&self.inner.backends);
        Arc::clone(backends.entry(kind).or_insert_with(|| {
            agent::create_backend(kind, &self.inner.config, Arc::clone(&self.inner.store))
        }))
    }

    fn task_backend(&self, task: &Task) -> BackendKind {
        match task.backend.parse::<BackendKind>() {
            Ok(kind) => kind,
            Err(_) => self.default_backend(),
        }
    }

    fn default_backend(&self) -> BackendKind {
        self.preference(
            prefs::DEFAULT_BACKEND,
            &self.inner.config.agents.default_backend,
        )
        .parse()
        .unwrap_or(BackendKind::Claude)
    }

    /// Stored preference, or `fallback` when unset or unreadable.
    fn preference(&self, key: &str, fallback: &str) -> String {
        match self.inner.store.get_preference(key) {
            Ok(Some(v)) if !v.trim().is_empty() => v,
            Ok(_) => fallback.to_owned(),
            Err(e) => {
                debug!(key, error = %e, "preference lookup failed");
                fallback.to_owned()
            }
        }
    }

    fn notify(&self) {
        self.inner.notifier.notify();
    }
}
