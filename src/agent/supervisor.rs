#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _};
use tokio::process::{Child, ChildStderr};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::agent::stream::{self, LineBuffer, Record};
use crate::agent::transcript::{Transcript, TurnTiming};
use crate::agent::{AgentBackend, BackendKind, TurnEvent, TurnHandle, TurnRequest};
use crate::error::OrchError;
use crate::task::store::Store;

const STDERR_TAIL_LINES: usize = 20;
const READ_CHUNK: usize = 8 * 1024;

/// The parts that differ between agent CLIs: how to invoke them, what to
/// write on stdin, and how to read their output records.
pub trait Protocol: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    fn executable(&self) -> &str;

    /// Invocation arguments; `resume` carries the cached session token.
    fn args(&self, workspace: &Path, resume: Option<&str>) -> Vec<String>;

    /// Bytes written to stdin before it is closed.
    ///
    /// Claude reads one `{"type":"user","message":{...}}` line in
    /// stream-json input mode; `codex exec -` reads the prompt as plain text.
    fn stdin_payload(&self, prompt: &str) -> Vec<u8>;

    fn decode(&self, record: &Value) -> Vec<Record>;
}

#[derive(Debug)]
struct LiveTurn {
    turn_id: u64,
    kill: Option<oneshot::Sender<()>>,
}

#[derive(Debug)]
struct Session {
    session_id: Option<String>,
    workspace: PathBuf,
    turn: Option<LiveTurn>,
    waiting_for_input: bool,
}

type Registry = Arc<Mutex<HashMap<String, Session>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, Session>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process supervisor shared by every agent CLI. Tracks one [`Session`] per
/// task id; an entry survives a successful turn (so its token can be
/// resumed) and is dropped on failure or `stop`.
pub struct Supervisor<P: Protocol> {
    protocol: Arc<P>,
    store: Arc<dyn Store>,
    timing: TurnTiming,
    sessions: Registry,
    next_turn: AtomicU64,
}

impl<P: Protocol> Supervisor<P> {
    pub fn new(protocol: P, store: Arc<dyn Store>, timing: TurnTiming) -> Self {
        Self {
            protocol: Arc::new(protocol),
            store,
            timing,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_turn: AtomicU64::new(1),
        }
    }

    fn dispatch(&self, request: TurnRequest, resume: bool) -> Result<TurnHandle, OrchError> {
        let (events, rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let turn_id = self.next_turn.fetch_add(1, Ordering::Relaxed);
        let task_id = request.task_id.clone();

        let token = {
            let mut sessions = lock(&self.sessions);
            let entry = sessions.entry(task_id.clone()).or_insert_with(|| Session {
                session_id: None,
                workspace: request.workspace.clone(),
                turn: None,
                waiting_for_input: false,
            });
            if entry.turn.is_some() {
                return Err(OrchError::AlreadyRunning(task_id));
            }
            if !resume {
                entry.session_id = None;
            }
            entry.workspace.clone_from(&request.workspace);
            entry.waiting_for_input = false;
            entry.turn = Some(LiveTurn {
                turn_id,
                kill: Some(kill_tx),
            });
            entry.session_id.clone()
        };

        if resume && token.is_none() {
            warn!(%task_id, backend = %self.protocol.kind(), "no session token cached; starting a new conversation");
        }

        let exe = self.protocol.executable().to_owned();
        let args = self.protocol.args(&request.workspace, token.as_deref());
        let mut cmd = tokio::process::Command::new(&exe);
        cmd.args(&args)
            .current_dir(&request.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                forget_turn(&self.sessions, &task_id, turn_id);
                let reason = match e.kind() {
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                        OrchError::BackendNotFound {
                            backend: self.protocol.kind().to_string(),
                            executable: exe,
                        }
                        .to_string()
                    }
                    _ => format!("failed to start {exe}: {e}"),
                };
                warn!(%task_id, backend = %self.protocol.kind(), error = %reason, "agent spawn failed");
                let _ = events.send(TurnEvent::Failed(reason));
                return Ok(TurnHandle::new(rx));
            }
        };

        info!(
            %task_id,
            backend = %self.protocol.kind(),
            resume = token.is_some(),
            pid = child.id(),
            "agent process started"
        );

        let monitor = Monitor {
            protocol: Arc::clone(&self.protocol),
            sessions: Arc::clone(&self.sessions),
            transcript: Transcript::new(Arc::clone(&self.store), &task_id, self.timing),
            task_id,
            turn_id,
            events,
            agent_error: None,
        };
        let payload = self.protocol.stdin_payload(&request.prompt);
        tokio::spawn(monitor.run(child, payload, kill_rx));
        Ok(TurnHandle::new(rx))
    }
}

impl<P: Protocol> AgentBackend for Supervisor<P> {
    fn kind(&self) -> BackendKind {
        self.protocol.kind()
    }

    fn run_turn(&self, request: TurnRequest) -> Result<TurnHandle, OrchError> {
        self.dispatch(request, false)
    }

    fn resume_turn(&self, request: TurnRequest) -> Result<TurnHandle, OrchError> {
        self.dispatch(request, true)
    }

    fn stop(&self, task_id: &str) -> bool {
        let Some(session) = lock(&self.sessions).remove(task_id) else {
            return false;
        };
        let Some(kill) = session.turn.and_then(|t| t.kill) else {
            return false;
        };
        info!(%task_id, backend = %self.protocol.kind(), "stopping agent process");
        kill.send(()).is_ok()
    }

    fn is_running(&self, task_id: &str) -> bool {
        lock(&self.sessions)
            .get(task_id)
            .is_some_and(|s| s.turn.is_some())
    }

    fn is_waiting_for_input(&self, task_id: &str) -> bool {
        lock(&self.sessions)
            .get(task_id)
            .is_some_and(|s| s.turn.is_none() && s.waiting_for_input)
    }

    fn adopt_session(&self, task_id: &str, session_id: &str, workspace: PathBuf) {
        let mut sessions = lock(&self.sessions);
        if sessions.get(task_id).is_some_and(|s| s.turn.is_some()) {
            return;
        }
        sessions.insert(
            task_id.to_owned(),
            Session {
                session_id: Some(session_id.to_owned()),
                workspace,
                turn: None,
                waiting_for_input: true,
            },
        );
    }
}

/// Drop the task's entry if it still belongs to `turn_id`.
fn forget_turn(sessions: &Registry, task_id: &str, turn_id: u64) {
    let mut sessions = lock(sessions);
    let owned = sessions
        .get(task_id)
        .and_then(|s| s.turn.as_ref())
        .is_some_and(|t| t.turn_id == turn_id);
    if owned {
        sessions.remove(task_id);
    }
}

/// Owns one running process until it exits.
struct Monitor<P: Protocol> {
    protocol: Arc<P>,
    sessions: Registry,
    transcript: Transcript,
    task_id: String,
    turn_id: u64,
    events: mpsc::UnboundedSender<TurnEvent>,
    agent_error: Option<String>,
}

impl<P: Protocol> Monitor<P> {
    async fn run(mut self, mut child: Child, payload: Vec<u8>, mut kill: oneshot::Receiver<()>) {
        if let Some(mut stdin) = child.stdin.take() {
            let task_id = self.task_id.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(%task_id, error = %e, "failed to write agent stdin");
                }
                let _ = stdin.shutdown().await;
            });
        }
        let stderr_tail = child
            .stderr
            .take()
            .map(|err| spawn_stderr_reader(err, self.task_id.clone()));

        let mut killed = false;
        let mut lines = LineBuffer::new();
        if let Some(mut stdout) = child.stdout.take() {
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                let flush_at = self.transcript.flush_deadline();
                tokio::select! {
                    () = time::sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                        self.transcript.flush_pending();
                    }
                    _ = &mut kill, if !killed => {
                        killed = true;
                        let _ = child.start_kill();
                    }
                    read = stdout.read(&mut chunk) => match read {
                        Ok(0) => break,
                        Ok(n) => {
                            for line in lines.push(&chunk[..n]) {
                                self.handle_line(&line);
                            }
                        }
                        Err(e) => {
                            debug!(task_id = %self.task_id, error = %e, "agent stdout read failed");
                            break;
                        }
                    }
                }
            }
        }
        if let Some(rest) = lines.finish() {
            self.handle_line(&rest);
        }

        let status = tokio::select! {
            status = child.wait() => status,
            _ = &mut kill, if !killed => {
                killed = true;
                let _ = child.start_kill();
                child.wait().await
            }
        };
        let stderr_tail = match stderr_tail {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        self.transcript.finish();
        self.conclude(status, killed, &stderr_tail);
    }

    fn handle_line(&mut self, line: &str) {
        let Some(value) = stream::parse_line(line) else {
            if !line.trim().is_empty() {
                debug!(task_id = %self.task_id, line = %truncate(line, 200), "discarding non-protocol output");
            }
            return;
        };
        for record in self.protocol.decode(&value) {
            match record {
                Record::Session(id) => {
                    if self.transcript.capture_session(&id) {
                        self.cache_session(&id);
                    }
                }
                Record::StreamStarted => self.transcript.reset(),
                Record::Delta(text) => {
                    self.transcript.push_delta(&text);
                    let _ = self.events.send(TurnEvent::Message(text));
                }
                Record::Message(text) => {
                    if self.transcript.push_message(&text) {
                        let _ = self.events.send(TurnEvent::Message(text));
                    }
                }
                Record::Model(model) => debug!(task_id = %self.task_id, %model, "agent model"),
                Record::Reasoning(text) => {
                    debug!(task_id = %self.task_id, reasoning = %truncate(&text, 200), "agent reasoning");
                }
                Record::Error(msg) => {
                    warn!(task_id = %self.task_id, error = %msg, "agent reported an error");
                    self.agent_error = Some(msg);
                }
            }
        }
    }

    fn cache_session(&self, session_id: &str) {
        let mut sessions = lock(&self.sessions);
        if let Some(session) = sessions.get_mut(&self.task_id)
            && session.turn.as_ref().is_some_and(|t| t.turn_id == self.turn_id)
        {
            session.session_id = Some(session_id.to_owned());
        }
    }

    fn conclude(self, status: std::io::Result<ExitStatus>, killed: bool, stderr_tail: &str) {
        let backend = self.protocol.kind();
        let failure = match (&status, killed) {
            (_, true) => Some("agent process was stopped".to_owned()),
            (Err(e), _) => Some(format!("failed to wait for {backend}: {e}")),
            (Ok(st), _) if !st.success() => Some(match st.code() {
                Some(code) => format!("{backend} exited with code {code}"),
                None => format!("{backend} was terminated by a signal"),
            }),
            (Ok(_), _) => self.agent_error.clone(),
        };

        let event = match failure {
            None => {
                let mut sessions = lock(&self.sessions);
                if let Some(session) = sessions.get_mut(&self.task_id)
                    && session.turn.as_ref().is_some_and(|t| t.turn_id == self.turn_id)
                {
                    session.turn = None;
                    session.waiting_for_input = true;
                }
                info!(task_id = %self.task_id, %backend, "agent turn completed");
                TurnEvent::Completed
            }
            Some(mut reason) => {
                forget_turn(&self.sessions, &self.task_id, self.turn_id);
                if let Some(agent_error) = self.agent_error.as_deref()
                    && !reason.contains(agent_error)
                {
                    reason = format!("{reason}: {agent_error}");
                }
                if !killed && !stderr_tail.is_empty() {
                    reason = format!("{reason}\n{stderr_tail}");
                }
                let exit_code = status.as_ref().ok().and_then(ExitStatus::code);
                warn!(task_id = %self.task_id, %backend, ?exit_code, "agent turn failed");
                TurnEvent::Failed(reason)
            }
        };
        let _ = self.events.send(event);
    }
}

fn spawn_stderr_reader(stderr: ChildStderr, task_id: String) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(stderr).lines();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        while let Ok(Some(line)) = reader.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            debug!(%task_id, stderr = %line, "agent stderr");
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Vec::from(tail).join("\n")
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt as _;
    use std::time::Duration;

    use super::*;
    use crate::agent::ClaudeProtocol;
    use crate::task::model::{NewTask, Task};
    use crate::task::store::MemoryStore;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn supervisor(exe: &Path, store: Arc<MemoryStore>) -> Supervisor<ClaudeProtocol> {
        Supervisor::new(
            ClaudeProtocol::new(&exe.to_string_lossy()),
            store,
            TurnTiming {
                flush_interval: Duration::ZERO,
                progress_interval: Duration::ZERO,
            },
        )
    }

    impl<P: Protocol> Supervisor<P> {
        fn cached_session(&self, task_id: &str) -> Option<String> {
            lock(&self.sessions)
                .get(task_id)
                .and_then(|s| s.session_id.clone())
        }
    }

    fn request(task_id: &str, dir: &Path) -> TurnRequest {
        TurnRequest {
            task_id: task_id.to_owned(),
            prompt: "add a health endpoint".to_owned(),
            workspace: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn successful_turn_keeps_session_for_resume() {
        let td = tempfile::tempdir().unwrap();
        let exe = script(
            td.path(),
            "agent",
            r#"cat > "$(dirname "$0")/stdin.txt"
echo "$@" > "$(dirname "$0")/args.txt"
echo 'booting'
echo '{"type":"system","subtype":"init","session_id":"sess-1","model":"m"}'
printf '{"type":"assistant","message":{"content":[{"type":"text","text":"Done."}]}}\n'"#,
        );
        let store = Arc::new(MemoryStore::new());
        let task = store.create_task(Task::new(NewTask::default())).unwrap();
        let sup = supervisor(&exe, store.clone());

        let mut handle = sup.run_turn(request(&task.id, td.path())).unwrap();
        assert!(matches!(
            sup.run_turn(request(&task.id, td.path())),
            Err(OrchError::AlreadyRunning(_))
        ));
        assert_eq!(handle.next().await, Some(TurnEvent::Message("Done.".to_owned())));
        assert_eq!(handle.next().await, Some(TurnEvent::Completed));

        assert!(!sup.is_running(&task.id));
        assert!(sup.is_waiting_for_input(&task.id));
        assert_eq!(sup.cached_session(&task.id).as_deref(), Some("sess-1"));
        let msgs = store.get_messages_for_task(&task.id).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "Done.");
        assert_eq!(
            store.require_task(&task.id).unwrap().session_id.as_deref(),
            Some("sess-1")
        );
        let stdin = std::fs::read_to_string(td.path().join("stdin.txt")).unwrap();
        assert!(stdin.contains(r#""content":"add a health endpoint""#));

        let handle = sup.resume_turn(request(&task.id, td.path())).unwrap();
        assert_eq!(handle.outcome().await, Ok(()));
        let args = std::fs::read_to_string(td.path().join("args.txt")).unwrap();
        assert!(args.contains("--resume sess-1"), "{args}");
        assert_eq!(store.get_messages_for_task(&task.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn nonzero_exit_drops_the_entry() {
        let td = tempfile::tempdir().unwrap();
        let exe = script(
            td.path(),
            "agent",
            r#"cat > /dev/null
echo '{"type":"system","subtype":"init","session_id":"sess-9"}'
echo 'rate limited' >&2
exit 1"#,
        );
        let store = Arc::new(MemoryStore::new());
        let sup = supervisor(&exe, store);
        let handle = sup.run_turn(request("t-1", td.path())).unwrap();
        let err = handle.outcome().await.unwrap_err();
        assert!(err.contains("exited with code 1"), "{err}");
        assert!(err.contains("rate limited"), "{err}");
        assert!(!sup.is_running("t-1"));
        assert!(!sup.is_waiting_for_input("t-1"));
        assert_eq!(sup.cached_session("t-1"), None);
    }

    #[tokio::test]
    async fn error_record_fails_a_clean_exit() {
        let td = tempfile::tempdir().unwrap();
        let exe = script(
            td.path(),
            "agent",
            r#"cat > /dev/null
echo '{"type":"result","subtype":"error_during_execution","is_error":true,"result":"tool crashed","session_id":"s"}'"#,
        );
        let sup = supervisor(&exe, Arc::new(MemoryStore::new()));
        let err = sup
            .run_turn(request("t-2", td.path()))
            .unwrap()
            .outcome()
            .await
            .unwrap_err();
        assert!(err.contains("tool crashed"), "{err}");
    }

    #[tokio::test]
    async fn missing_binary_fails_without_tracking() {
        let td = tempfile::tempdir().unwrap();
        let sup = supervisor(&td.path().join("nope"), Arc::new(MemoryStore::new()));
        let err = sup
            .run_turn(request("t-3", td.path()))
            .unwrap()
            .outcome()
            .await
            .unwrap_err();
        assert!(err.contains("not found"), "{err}");
        assert!(!sup.is_running("t-3"));
    }

    #[tokio::test]
    async fn stop_kills_the_process() {
        let td = tempfile::tempdir().unwrap();
        let exe = script(td.path(), "agent", "cat > /dev/null\nexec sleep 30");
        let sup = supervisor(&exe, Arc::new(MemoryStore::new()));
        let handle = sup.run_turn(request("t-4", td.path())).unwrap();
        assert!(sup.is_running("t-4"));
        assert!(sup.stop("t-4"));
        assert!(!sup.is_running("t-4"));

        let outcome = tokio::time::timeout(Duration::from_secs(10), handle.outcome())
            .await
            .unwrap();
        assert!(outcome.is_err());
        assert!(!sup.stop("t-4"));
    }

    #[tokio::test]
    async fn held_back_text_is_written_while_the_agent_is_quiet() {
        let td = tempfile::tempdir().unwrap();
        let exe = script(
            td.path(),
            "agent",
            r#"cat > /dev/null
echo '{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"Do"}}}'
echo '{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"ne."}}}'
exec sleep 30"#,
        );
        let store = Arc::new(MemoryStore::new());
        let sup = Supervisor::new(
            ClaudeProtocol::new(&exe.to_string_lossy()),
            store.clone(),
            TurnTiming {
                flush_interval: Duration::from_millis(50),
                progress_interval: Duration::from_secs(3600),
            },
        );
        let _handle = sup.run_turn(request("t-5", td.path())).unwrap();

        let mut latest = String::new();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if let Some(m) = store.get_messages_for_task("t-5").unwrap().pop() {
                latest = m.content;
                if latest == "Done." {
                    break;
                }
            }
        }
        assert_eq!(latest, "Done.");
        assert!(sup.is_running("t-5"));
        assert!(sup.stop("t-5"));
    }
}
