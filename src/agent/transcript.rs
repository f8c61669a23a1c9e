#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::task::model::{Message, Role, TaskPatch};
use crate::task::progress;
use crate::task::store::Store;

/// Write cadence for one turn's assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnTiming {
    /// Minimum gap between message updates after the first write.
    pub flush_interval: Duration,
    /// Minimum gap between progress scans of the buffer.
    pub progress_interval: Duration,
}

impl Default for TurnTiming {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(500),
            progress_interval: Duration::from_millis(2000),
        }
    }
}

/// Rolling assistant buffer for a single turn and its persistence policy.
///
/// The first content creates the message row immediately, later content
/// updates it at most once per `flush_interval`, and [`Transcript::finish`]
/// always writes the trimmed buffer. Each turn gets its own row.
///
/// Content held back by the interval is reported through
/// [`Transcript::flush_deadline`]; the owner calls
/// [`Transcript::flush_pending`] once it passes so a quiet stream does not
/// leave the row stale.
pub struct Transcript {
    store: Arc<dyn Store>,
    task_id: String,
    timing: TurnTiming,
    buffer: String,
    message_id: Option<String>,
    saw_delta: bool,
    // Buffer has changed since the last successful write.
    dirty: bool,
    session_captured: bool,
    last_flush: Option<Instant>,
    last_progress: Option<Instant>,
}

impl Transcript {
    pub fn new(store: Arc<dyn Store>, task_id: &str, timing: TurnTiming) -> Self {
        Self {
            store,
            task_id: task_id.to_owned(),
            timing,
            buffer: String::new(),
            message_id: None,
            saw_delta: false,
            dirty: false,
            session_captured: false,
            last_flush: None,
            last_progress: None,
        }
    }

    /// Record the turn's session token on the task row. Only the first token
    /// of a turn counts; returns whether this one was taken.
    pub fn capture_session(&mut self, session_id: &str) -> bool {
        if self.session_captured || session_id.trim().is_empty() {
            return false;
        }
        self.session_captured = true;
        let patch = TaskPatch {
            session_id: Some(Some(session_id.to_owned())),
            ..TaskPatch::default()
        };
        if let Err(e) = self.store.update_task(&self.task_id, patch) {
            warn!(task_id = %self.task_id, error = %e, "failed to persist session id");
        }
        true
    }

    /// A new logical message started; drop what has been buffered so far.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.saw_delta = false;
    }

    pub fn push_delta(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.saw_delta = true;
        self.buffer.push_str(text);
        self.dirty = true;
        self.persist(false);
    }

    /// Append a complete message. Ignored when deltas already carried the
    /// same content; returns whether the text was used.
    pub fn push_message(&mut self, text: &str) -> bool {
        if self.saw_delta || text.trim().is_empty() {
            return false;
        }
        if !self.buffer.is_empty() {
            self.buffer.push_str("\n\n");
        }
        self.buffer.push_str(text);
        self.dirty = true;
        self.persist(false);
        true
    }

    /// When held-back content becomes writable, if any is pending.
    #[must_use]
    pub fn flush_deadline(&self) -> Option<Instant> {
        if !self.dirty || self.message_id.is_none() {
            return None;
        }
        self.last_flush.map(|t| t + self.timing.flush_interval)
    }

    /// Write held-back content if its interval has elapsed.
    pub fn flush_pending(&mut self) {
        if self.dirty {
            self.persist(false);
        }
    }

    /// Final write for the turn, after the process has exited.
    pub fn finish(&mut self) {
        self.persist(true);
    }

    fn persist(&mut self, force: bool) {
        let content = if force {
            self.buffer.trim()
        } else {
            self.buffer.as_str()
        };
        let now = Instant::now();

        match self.message_id.as_deref() {
            None => {
                if content.trim().is_empty() {
                    return;
                }
                let msg = Message::new(&self.task_id, Role::Assistant, content);
                match self.store.create_message(msg) {
                    Ok(msg) => self.message_id = Some(msg.id),
                    Err(e) => {
                        warn!(task_id = %self.task_id, error = %e, "failed to create assistant message");
                        return;
                    }
                }
            }
            Some(id) => {
                let due = self
                    .last_flush
                    .is_none_or(|t| now.duration_since(t) >= self.timing.flush_interval);
                if !force && !due {
                    return;
                }
                if let Err(e) = self.store.update_message(id, content) {
                    warn!(task_id = %self.task_id, error = %e, "failed to update assistant message");
                    // retry after another interval
                    self.last_flush = Some(now);
                    return;
                }
            }
        }
        self.last_flush = Some(now);
        self.dirty = false;

        let progress_due = self
            .last_progress
            .is_none_or(|t| now.duration_since(t) >= self.timing.progress_interval);
        if force || progress_due {
            self.last_progress = Some(now);
            self.update_progress();
        }
    }

    fn update_progress(&self) {
        let Some(found) = progress::extract(&self.buffer) else {
            return;
        };
        let task = match self.store.get_task(&self.task_id) {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(e) => {
                debug!(task_id = %self.task_id, error = %e, "progress: task lookup failed");
                return;
            }
        };
        if let Some(patch) = progress::progress_patch(&task, found)
            && let Err(e) = self.store.update_task(&self.task_id, patch)
        {
            warn!(task_id = %self.task_id, error = %e, "failed to persist progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::{NewTask, Task};
    use crate::task::store::MemoryStore;

    fn setup(timing: TurnTiming) -> (Arc<MemoryStore>, String, Transcript) {
        let store = Arc::new(MemoryStore::new());
        let task = store.create_task(Task::new(NewTask::default())).unwrap();
        let t = Transcript::new(store.clone(), &task.id, timing);
        (store, task.id, t)
    }

    fn slow() -> TurnTiming {
        TurnTiming {
            flush_interval: Duration::from_secs(3600),
            progress_interval: Duration::from_secs(3600),
        }
    }

    fn contents(store: &MemoryStore, task_id: &str) -> Vec<String> {
        store
            .get_messages_for_task(task_id)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect()
    }

    #[tokio::test]
    async fn first_content_is_written_then_debounced_then_flushed() {
        let (store, task_id, mut t) = setup(slow());
        t.push_delta("Do");
        assert_eq!(contents(&store, &task_id), vec!["Do"]);

        t.push_delta("ne.");
        t.push_delta("  \n");
        assert_eq!(contents(&store, &task_id), vec!["Do"]);

        t.finish();
        assert_eq!(contents(&store, &task_id), vec!["Done."]);
    }

    #[tokio::test(start_paused = true)]
    async fn held_back_content_is_written_once_the_interval_passes() {
        let (store, task_id, mut t) = setup(TurnTiming {
            flush_interval: Duration::from_millis(500),
            progress_interval: Duration::from_secs(3600),
        });
        assert_eq!(t.flush_deadline(), None);
        t.push_delta("Do");
        assert_eq!(t.flush_deadline(), None);

        t.push_delta("ne.");
        let deadline = t.flush_deadline().unwrap();
        t.flush_pending();
        assert_eq!(contents(&store, &task_id), vec!["Do"]);

        tokio::time::sleep_until(deadline).await;
        t.flush_pending();
        assert_eq!(contents(&store, &task_id), vec!["Done."]);
        assert_eq!(t.flush_deadline(), None);
    }

    #[tokio::test]
    async fn zero_interval_writes_every_delta() {
        let (store, task_id, mut t) = setup(TurnTiming {
            flush_interval: Duration::ZERO,
            progress_interval: Duration::ZERO,
        });
        t.push_delta("a");
        t.push_delta("b");
        assert_eq!(contents(&store, &task_id), vec!["ab"]);
    }

    #[tokio::test]
    async fn complete_message_after_deltas_is_ignored() {
        let (store, task_id, mut t) = setup(slow());
        t.push_delta("Hello");
        assert!(!t.push_message("Hello"));
        t.finish();
        assert_eq!(contents(&store, &task_id), vec!["Hello"]);
    }

    #[tokio::test]
    async fn stream_start_resets_buffer() {
        let (store, task_id, mut t) = setup(slow());
        t.push_delta("draft");
        t.reset();
        t.push_delta("final");
        t.finish();
        assert_eq!(contents(&store, &task_id), vec!["final"]);
    }

    #[tokio::test]
    async fn complete_messages_join() {
        let (store, task_id, mut t) = setup(slow());
        assert!(t.push_message("one"));
        assert!(t.push_message("two"));
        t.finish();
        assert_eq!(contents(&store, &task_id), vec!["one\n\ntwo"]);
    }

    #[tokio::test]
    async fn no_content_means_no_row() {
        let (store, task_id, mut t) = setup(slow());
        t.push_delta("");
        t.finish();
        assert!(contents(&store, &task_id).is_empty());
        assert_eq!(t.message_id, None);
    }

    #[tokio::test]
    async fn first_session_token_wins_and_is_persisted() {
        let (store, task_id, mut t) = setup(slow());
        assert!(t.capture_session("s-1"));
        assert!(!t.capture_session("s-2"));
        assert_eq!(
            store.require_task(&task_id).unwrap().session_id.as_deref(),
            Some("s-1")
        );
    }

    #[tokio::test]
    async fn progress_is_extracted_on_final_write() {
        let (store, task_id, mut t) = setup(slow());
        t.push_delta("Starting.");
        t.push_delta(" {\"total\": 4, \"completed\": 1}");
        let task = store.require_task(&task_id).unwrap();
        assert_eq!(task.total_subtasks, 0);

        t.finish();
        let task = store.require_task(&task_id).unwrap();
        assert_eq!(task.total_subtasks, 4);
        assert_eq!(task.completed_subtasks, 1);
        assert_eq!(task.progress_percent, 25);
    }
}
