#![forbid(unsafe_code)]

//! Supervisors for external coding-agent CLIs.

pub mod claude;
pub mod codex;
pub mod stream;
pub mod supervisor;
pub mod transcript;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::OrchError;
use crate::task::store::Store;

pub use self::claude::ClaudeProtocol;
pub use self::codex::CodexProtocol;
pub use self::supervisor::{Protocol, Supervisor};
pub use self::transcript::TurnTiming;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Claude,
    Codex,
}

impl BackendKind {
    pub const ALL: [Self; 2] = [Self::Claude, Self::Codex];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = OrchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" | "claude-code" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            _ => Err(OrchError::UnknownBackend(s.to_owned())),
        }
    }
}

/// What a turn needs: which task, what to say, and where to run.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub task_id: String,
    pub prompt: String,
    pub workspace: PathBuf,
}

/// Output of one turn: zero or more `Message`s, then exactly one of
/// `Completed` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// Assistant text as it arrives (a delta or a whole message).
    Message(String),
    Completed,
    Failed(String),
}

/// Receiving end of a dispatched turn.
#[derive(Debug)]
pub struct TurnHandle {
    events: mpsc::UnboundedReceiver<TurnEvent>,
}

impl TurnHandle {
    #[must_use]
    pub fn new(events: mpsc::UnboundedReceiver<TurnEvent>) -> Self {
        Self { events }
    }

    /// Next event, or `None` once the supervisor has gone away.
    pub async fn next(&mut self) -> Option<TurnEvent> {
        self.events.recv().await
    }

    /// Drain the turn and return its outcome.
    pub async fn outcome(mut self) -> Result<(), String> {
        while let Some(event) = self.next().await {
            match event {
                TurnEvent::Message(_) => {}
                TurnEvent::Completed => return Ok(()),
                TurnEvent::Failed(reason) => return Err(reason),
            }
        }
        Err("agent supervisor ended without a result".to_owned())
    }
}

/// One long-lived supervisor per agent CLI, shared by every task using it.
///
/// `run_turn` and `resume_turn` spawn the process and return immediately;
/// they must be called from within a Tokio runtime. Both refuse with
/// [`OrchError::AlreadyRunning`] while a process for the task is alive.
pub trait AgentBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start a fresh conversation.
    fn run_turn(&self, request: TurnRequest) -> Result<TurnHandle, OrchError>;

    /// Continue the task's conversation using its cached session token.
    fn resume_turn(&self, request: TurnRequest) -> Result<TurnHandle, OrchError>;

    /// Signal the task's process (best effort) and forget the task. Returns
    /// whether a live process was signalled.
    fn stop(&self, task_id: &str) -> bool;

    fn is_running(&self, task_id: &str) -> bool;

    /// The last turn ended normally and a resume is possible.
    fn is_waiting_for_input(&self, task_id: &str) -> bool;

    /// Register a persisted session so it can be resumed after a restart.
    /// No-op while a process for the task is alive.
    fn adopt_session(&self, task_id: &str, session_id: &str, workspace: PathBuf);
}

/// Build the supervisor for `kind` using the configured executable.
#[must_use]
pub fn create_backend(
    kind: BackendKind,
    config: &Config,
    store: Arc<dyn Store>,
) -> Arc<dyn AgentBackend> {
    let timing = TurnTiming {
        flush_interval: config.orchestrator.flush_interval(),
        progress_interval: config.orchestrator.progress_interval(),
    };
    match kind {
        BackendKind::Claude => Arc::new(Supervisor::new(
            ClaudeProtocol::new(&config.agents.claude_executable),
            store,
            timing,
        )),
        BackendKind::Codex => Arc::new(Supervisor::new(
            CodexProtocol::new(&config.agents.codex_executable),
            store,
            timing,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_parse() {
        assert_eq!("claude".parse::<BackendKind>().unwrap(), BackendKind::Claude);
        assert_eq!(" Codex ".parse::<BackendKind>().unwrap(), BackendKind::Codex);
        let err = "gpt".parse::<BackendKind>().unwrap_err();
        assert!(matches!(err, OrchError::UnknownBackend(_)));
        for kind in BackendKind::ALL {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
    }

    #[tokio::test]
    async fn outcome_skips_messages() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(TurnEvent::Message("a".to_owned())).unwrap();
        tx.send(TurnEvent::Failed("boom".to_owned())).unwrap();
        assert_eq!(TurnHandle::new(rx).outcome().await, Err("boom".to_owned()));

        let (tx, rx) = mpsc::unbounded_channel::<TurnEvent>();
        drop(tx);
        assert!(TurnHandle::new(rx).outcome().await.is_err());
    }
}
