#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::OrchError;
use crate::task::model::{Message, Task, TaskPatch};

/// Preference keys read by the orchestrator.
pub mod prefs {
    pub const DEFAULT_BACKEND: &str = "default_backend";
    pub const BRANCH_PREFIX: &str = "branch_prefix";
    pub const BASE_BRANCH: &str = "base_branch";
}

/// Task, message and preference persistence.
///
/// All writes are upserts by id; implementations must be safe to call from
/// several tokio tasks at once.
pub trait Store: Send + Sync {
    fn get_task(&self, id: &str) -> anyhow::Result<Option<Task>>;
    fn get_all_tasks(&self) -> anyhow::Result<Vec<Task>>;
    fn create_task(&self, task: Task) -> anyhow::Result<Task>;
    fn update_task(&self, id: &str, patch: TaskPatch) -> anyhow::Result<Task>;
    /// Apply `patch` only if `when` holds for the stored row, checked and
    /// written under the same lock. `Ok(None)` means the row was left alone.
    fn update_task_if(
        &self,
        id: &str,
        when: &dyn Fn(&Task) -> bool,
        patch: TaskPatch,
    ) -> anyhow::Result<Option<Task>>;
    fn delete_task(&self, id: &str) -> anyhow::Result<()>;

    fn get_messages_for_task(&self, task_id: &str) -> anyhow::Result<Vec<Message>>;
    fn create_message(&self, message: Message) -> anyhow::Result<Message>;
    fn update_message(&self, id: &str, content: &str) -> anyhow::Result<()>;

    fn get_preference(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set_preference(&self, key: &str, value: &str) -> anyhow::Result<()>;

    /// Like [`Store::get_task`] but a missing row is an error.
    fn require_task(&self, id: &str) -> anyhow::Result<Task> {
        self.get_task(id)?
            .ok_or_else(|| OrchError::TaskNotFound(id.to_owned()).into())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tasks: BTreeMap<String, Task>,
    messages: Vec<Message>,
    prefs: HashMap<String, String>,
}

/// In-process [`Store`], used by tests and embedders that bring their own
/// durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Store for MemoryStore {
    fn get_task(&self, id: &str) -> anyhow::Result<Option<Task>> {
        Ok(self.state().tasks.get(id).cloned())
    }

    fn get_all_tasks(&self) -> anyhow::Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.state().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    fn create_task(&self, task: Task) -> anyhow::Result<Task> {
        self.state().tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    fn update_task(&self, id: &str, patch: TaskPatch) -> anyhow::Result<Task> {
        let mut state = self.state();
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| OrchError::TaskNotFound(id.to_owned()))?;
        patch.apply(task);
        Ok(task.clone())
    }

    fn update_task_if(
        &self,
        id: &str,
        when: &dyn Fn(&Task) -> bool,
        patch: TaskPatch,
    ) -> anyhow::Result<Option<Task>> {
        let mut state = self.state();
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| OrchError::TaskNotFound(id.to_owned()))?;
        if !when(task) {
            return Ok(None);
        }
        patch.apply(task);
        Ok(Some(task.clone()))
    }

    fn delete_task(&self, id: &str) -> anyhow::Result<()> {
        let mut state = self.state();
        state.tasks.remove(id);
        state.messages.retain(|m| m.task_id != id);
        Ok(())
    }

    fn get_messages_for_task(&self, task_id: &str) -> anyhow::Result<Vec<Message>> {
        Ok(self
            .state()
            .messages
            .iter()
            .filter(|m| m.task_id == task_id)
            .cloned()
            .collect())
    }

    fn create_message(&self, message: Message) -> anyhow::Result<Message> {
        let mut state = self.state();
        if let Some(existing) = state.messages.iter_mut().find(|m| m.id == message.id) {
            *existing = message.clone();
        } else {
            state.messages.push(message.clone());
        }
        Ok(message)
    }

    fn update_message(&self, id: &str, content: &str) -> anyhow::Result<()> {
        let mut state = self.state();
        let msg = state
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| OrchError::MessageNotFound(id.to_owned()))?;
        content.clone_into(&mut msg.content);
        Ok(())
    }

    fn get_preference(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.state().prefs.get(key).cloned())
    }

    fn set_preference(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.state().prefs.insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::{NewTask, Role, TaskStatus};

    #[test]
    fn update_of_missing_task_is_an_error() {
        let store = MemoryStore::new();
        let err = store
            .update_task("nope", TaskPatch::default())
            .unwrap_err();
        assert!(err.to_string().contains("task not found"));
        assert!(store.require_task("nope").is_err());
    }

    #[test]
    fn conditional_update_leaves_non_matching_rows_alone() {
        let store = MemoryStore::new();
        let task = store.create_task(Task::new(NewTask::default())).unwrap();
        store
            .update_task(&task.id, TaskPatch::finish(TaskStatus::Cancelled, &task.created_at))
            .unwrap();

        let ready = TaskPatch {
            ready_to_act: Some(true),
            ..TaskPatch::default()
        };
        let running = |t: &Task| t.status == TaskStatus::Running;
        assert_eq!(store.update_task_if(&task.id, &running, ready.clone()).unwrap(), None);
        assert!(!store.require_task(&task.id).unwrap().ready_to_act);

        let cancelled = |t: &Task| t.status == TaskStatus::Cancelled;
        let row = store.update_task_if(&task.id, &cancelled, ready).unwrap();
        assert!(row.is_some_and(|t| t.ready_to_act));
        assert!(
            store
                .update_task_if("nope", &running, TaskPatch::default())
                .is_err()
        );
    }

    #[test]
    fn messages_keep_insertion_order_and_update_in_place() {
        let store = MemoryStore::new();
        let task = store.create_task(Task::new(NewTask::default())).unwrap();
        let first = store
            .create_message(Message::new(&task.id, Role::Assistant, "Do"))
            .unwrap();
        store
            .create_message(Message::new(&task.id, Role::User, "more"))
            .unwrap();
        store.update_message(&first.id, "Done.").unwrap();

        let msgs = store.get_messages_for_task(&task.id).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "Done.");
        assert_eq!(msgs[1].role, Role::User);
    }

    #[test]
    fn delete_drops_messages_too() {
        let store = MemoryStore::new();
        let task = store.create_task(Task::new(NewTask::default())).unwrap();
        store
            .create_message(Message::new(&task.id, Role::Assistant, "x"))
            .unwrap();
        store.delete_task(&task.id).unwrap();
        assert!(store.get_task(&task.id).unwrap().is_none());
        assert!(store.get_messages_for_task(&task.id).unwrap().is_empty());
    }

    #[test]
    fn preferences_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.get_preference(prefs::BRANCH_PREFIX).unwrap(), None);
        store.set_preference(prefs::BRANCH_PREFIX, "bot").unwrap();
        assert_eq!(
            store.get_preference(prefs::BRANCH_PREFIX).unwrap().as_deref(),
            Some("bot")
        );
        let task = store
            .update_task(
                &store.create_task(Task::new(NewTask::default())).unwrap().id,
                TaskPatch {
                    status: Some(TaskStatus::Running),
                    ..TaskPatch::default()
                },
            )
            .unwrap();
        assert_eq!(task.status, TaskStatus::Running);
    }
}
