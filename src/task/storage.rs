#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::Context as _;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::OrchError;
use crate::task::model::{Message, Task, TaskPatch};
use crate::task::store::Store;

/// File-backed [`Store`]: `task-<id>.json`, `messages-<id>.json` and
/// `preferences.json` under one directory. Every write goes through a temp
/// file and a rename.
#[derive(Debug)]
pub struct JsonStore {
    dir: PathBuf,
    // Serialises read-modify-write cycles within this process and caches
    // message id -> task id so streaming updates skip the directory scan.
    message_owners: Mutex<HashMap<String, String>>,
}

impl JsonStore {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            message_owners: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create data dir {}", self.dir.display()))
    }

    fn task_path(&self, id: &str) -> anyhow::Result<PathBuf> {
        validate_id(id)?;
        Ok(self.dir.join(format!("task-{id}.json")))
    }

    fn messages_path(&self, task_id: &str) -> anyhow::Result<PathBuf> {
        validate_id(task_id)?;
        Ok(self.dir.join(format!("messages-{task_id}.json")))
    }

    fn prefs_path(&self) -> PathBuf {
        self.dir.join("preferences.json")
    }

    fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> anyhow::Result<()> {
        self.ensure_dir()?;
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(value)?;
        std::fs::write(&tmp, &data)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    fn load_messages(&self, task_id: &str) -> anyhow::Result<Vec<Message>> {
        Ok(read_json(&self.messages_path(task_id)?)?.unwrap_or_default())
    }

    fn load_prefs(&self) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(read_json(&self.prefs_path())?.unwrap_or_default())
    }

    fn find_message_owner(&self, message_id: &str) -> anyhow::Result<Option<String>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read {}", self.dir.display()))?
        {
            let path = entry?.path();
            let Some(task_id) = path
                .file_name()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix("messages-"))
                .and_then(|s| s.strip_suffix(".json"))
            else {
                continue;
            };
            if self
                .load_messages(task_id)?
                .iter()
                .any(|m| m.id == message_id)
            {
                return Ok(Some(task_id.to_owned()));
            }
        }
        Ok(None)
    }
}

impl Store for JsonStore {
    fn get_task(&self, id: &str) -> anyhow::Result<Option<Task>> {
        read_json(&self.task_path(id)?)
    }

    fn get_all_tasks(&self) -> anyhow::Result<Vec<Task>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut tasks: Vec<Task> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read {}", self.dir.display()))?
        {
            let path = entry?.path();
            let is_task = path
                .file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|s| s.starts_with("task-") && s.ends_with(".json"));
            if !is_task {
                continue;
            }
            let Ok(data) = std::fs::read(&path) else {
                continue;
            };
            let Ok(task) = serde_json::from_slice(&data) else {
                tracing::warn!(path = %path.display(), "skipping unreadable task file");
                continue;
            };
            tasks.push(task);
        }
        tasks.sort_by(|a: &Task, b: &Task| {
            b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    fn create_task(&self, task: Task) -> anyhow::Result<Task> {
        let _guard = self.message_owners.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_json(&self.task_path(&task.id)?, &task)?;
        Ok(task)
    }

    fn update_task(&self, id: &str, patch: TaskPatch) -> anyhow::Result<Task> {
        let _guard = self.message_owners.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.task_path(id)?;
        let mut task: Task =
            read_json(&path)?.ok_or_else(|| OrchError::TaskNotFound(id.to_owned()))?;
        patch.apply(&mut task);
        self.write_json(&path, &task)?;
        Ok(task)
    }

    fn update_task_if(
        &self,
        id: &str,
        when: &dyn Fn(&Task) -> bool,
        patch: TaskPatch,
    ) -> anyhow::Result<Option<Task>> {
        let _guard = self.message_owners.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.task_path(id)?;
        let mut task: Task =
            read_json(&path)?.ok_or_else(|| OrchError::TaskNotFound(id.to_owned()))?;
        if !when(&task) {
            return Ok(None);
        }
        patch.apply(&mut task);
        self.write_json(&path, &task)?;
        Ok(Some(task))
    }

    fn delete_task(&self, id: &str) -> anyhow::Result<()> {
        let mut owners = self.message_owners.lock().unwrap_or_else(PoisonError::into_inner);
        owners.retain(|_, task_id| task_id.as_str() != id);
        for path in [self.task_path(id)?, self.messages_path(id)?] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to remove {}", path.display()));
                }
            }
        }
        Ok(())
    }

    fn get_messages_for_task(&self, task_id: &str) -> anyhow::Result<Vec<Message>> {
        self.load_messages(task_id)
    }

    fn create_message(&self, message: Message) -> anyhow::Result<Message> {
        let mut owners = self.message_owners.lock().unwrap_or_else(PoisonError::into_inner);
        let mut messages = self.load_messages(&message.task_id)?;
        if let Some(existing) = messages.iter_mut().find(|m| m.id == message.id) {
            *existing = message.clone();
        } else {
            messages.push(message.clone());
        }
        self.write_json(&self.messages_path(&message.task_id)?, &messages)?;
        owners.insert(message.id.clone(), message.task_id.clone());
        Ok(message)
    }

    fn update_message(&self, id: &str, content: &str) -> anyhow::Result<()> {
        let mut owners = self.message_owners.lock().unwrap_or_else(PoisonError::into_inner);
        let task_id = match owners.get(id) {
            Some(task_id) => task_id.clone(),
            None => self
                .find_message_owner(id)?
                .ok_or_else(|| OrchError::MessageNotFound(id.to_owned()))?,
        };
        owners.insert(id.to_owned(), task_id.clone());
        let mut messages = self.load_messages(&task_id)?;
        if let Some(msg) = messages.iter_mut().find(|m| m.id == id) {
            content.clone_into(&mut msg.content);
        }
        self.write_json(&self.messages_path(&task_id)?, &messages)
    }

    fn get_preference(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.load_prefs()?.remove(key))
    }

    fn set_preference(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let _guard = self.message_owners.lock().unwrap_or_else(PoisonError::into_inner);
        let mut prefs = self.load_prefs()?;
        prefs.insert(key.to_owned(), value.to_owned());
        self.write_json(&self.prefs_path(), &prefs)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    let value = serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

fn validate_id(id: &str) -> anyhow::Result<()> {
    if id.trim().is_empty() {
        anyhow::bail!("task ID is required");
    }
    if id.contains('/') || id.contains('\\') {
        anyhow::bail!("invalid ID '{id}': must not contain path separators");
    }
    if id.contains("..") {
        anyhow::bail!("invalid ID '{id}': must not contain '..'");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::{NewTask, Role, TaskStatus};

    fn store() -> (tempfile::TempDir, JsonStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path().join("data"));
        (dir, store)
    }

    #[test]
    fn tasks_survive_a_fresh_store_instance() {
        let (dir, store) = store();
        let task = store
            .create_task(Task::new(NewTask {
                prompt: "add a health endpoint".to_owned(),
                ..NewTask::default()
            }))
            .unwrap();
        store
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Running),
                    session_id: Some(Some("sess-1".to_owned())),
                    ..TaskPatch::default()
                },
            )
            .unwrap();

        let reopened = JsonStore::new(dir.path().join("data"));
        let loaded = reopened.require_task(&task.id).unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
        assert_eq!(loaded.session_id.as_deref(), Some("sess-1"));
        assert_eq!(reopened.get_all_tasks().unwrap().len(), 1);
    }

    #[test]
    fn conditional_update_checks_the_stored_row() {
        let (_dir, store) = store();
        let task = store.create_task(Task::new(NewTask::default())).unwrap();
        store
            .update_task(&task.id, TaskPatch::finish(TaskStatus::Failed, &task.created_at))
            .unwrap();

        let patch = TaskPatch {
            ready_to_act: Some(true),
            ..TaskPatch::default()
        };
        let skipped = store
            .update_task_if(&task.id, &|t: &Task| !t.status.is_terminal(), patch)
            .unwrap();
        assert_eq!(skipped, None);
        let row = store.require_task(&task.id).unwrap();
        assert_eq!(row.status, TaskStatus::Failed);
        assert!(!row.ready_to_act);
    }

    #[test]
    fn messages_update_in_place() {
        let (_dir, store) = store();
        let task = store.create_task(Task::new(NewTask::default())).unwrap();
        let msg = store
            .create_message(Message::new(&task.id, Role::Assistant, "Do"))
            .unwrap();
        store.update_message(&msg.id, "Done.").unwrap();
        let msgs = store.get_messages_for_task(&task.id).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "Done.");
        assert!(store.update_message("missing", "x").is_err());
    }

    #[test]
    fn delete_removes_task_and_messages() {
        let (_dir, store) = store();
        let task = store.create_task(Task::new(NewTask::default())).unwrap();
        store
            .create_message(Message::new(&task.id, Role::User, "hi"))
            .unwrap();
        store.delete_task(&task.id).unwrap();
        store.delete_task(&task.id).unwrap();
        assert!(store.get_task(&task.id).unwrap().is_none());
        assert!(store.get_messages_for_task(&task.id).unwrap().is_empty());
    }

    #[test]
    fn rejects_path_traversal_ids() {
        let (_dir, store) = store();
        assert!(store.get_task("../etc").is_err());
        assert!(store.get_task("a/b").is_err());
        assert!(store.get_task("").is_err());
    }

    #[test]
    fn preferences_persist() {
        let (_dir, store) = store();
        store.set_preference("branch_prefix", "bot").unwrap();
        assert_eq!(
            store.get_preference("branch_prefix").unwrap().as_deref(),
            Some("bot")
        );
        assert_eq!(store.get_preference("other").unwrap(), None);
    }
}
