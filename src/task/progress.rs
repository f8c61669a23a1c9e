#![forbid(unsafe_code)]

//! Subtask progress markers embedded in assistant output.
//!
//! Agents are prompted to report progress as a small JSON object, either in a
//! fenced code block or inline:
//!
//! ~~~text
//! ```json
//! {"progress": {"total": 5, "completed": 2}}
//! ```
//! ~~~
//!
//! or as a list of subtasks, each with a `status`. Every candidate in the
//! text is parsed; the one with the highest total (then highest completed
//! count) wins.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::task::model::{Task, TaskPatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub total: u32,
    pub completed: u32,
}

impl Progress {
    /// Rounded completion percentage, 0-100.
    #[must_use]
    pub fn percent(self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let total = u64::from(self.total);
        let pct = (u64::from(self.completed.min(self.total)) * 100 + total / 2) / total;
        u8::try_from(pct.min(100)).unwrap_or(100)
    }
}

static FENCED: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)```").ok());

const TOTAL_KEYS: &[&str] = &[
    "total",
    "totalSubtasks",
    "total_subtasks",
    "totalTasks",
    "total_tasks",
];
const COMPLETED_KEYS: &[&str] = &[
    "completed",
    "completedSubtasks",
    "completed_subtasks",
    "completedTasks",
    "completed_tasks",
    "done",
];
const LIST_KEYS: &[&str] = &["subtasks", "tasks", "steps", "items"];
const DONE_STATUSES: &[&str] = &["completed", "complete", "done", "finished"];

/// Find the best progress marker in `text`.
#[must_use]
pub fn extract(text: &str) -> Option<Progress> {
    let mut best: Option<Progress> = None;
    for candidate in candidates(text) {
        let Ok(value) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        let Some(p) = interpret(&value) else {
            continue;
        };
        let better = best.is_none_or(|b| (p.total, p.completed) > (b.total, b.completed));
        if better {
            best = Some(p);
        }
    }
    best.filter(|p| p.total > 0)
}

/// Task update for `progress`, or `None` when the stored counters already
/// match.
#[must_use]
pub fn progress_patch(task: &Task, progress: Progress) -> Option<TaskPatch> {
    let percent = progress.percent();
    if task.total_subtasks == progress.total
        && task.completed_subtasks == progress.completed
        && task.progress_percent == percent
    {
        return None;
    }
    Some(TaskPatch {
        total_subtasks: Some(progress.total),
        completed_subtasks: Some(progress.completed),
        progress_percent: Some(percent),
        ..TaskPatch::default()
    })
}

fn candidates(text: &str) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::new();
    if let Some(re) = FENCED.as_ref() {
        out.extend(
            re.captures_iter(text)
                .filter_map(|caps| caps.get(1))
                .map(|m| m.as_str().trim()),
        );
    }
    out.extend(balanced_objects(text));
    out
}

/// Top-level `{...}` spans, skipping braces inside JSON strings.
fn balanced_objects(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, b) in text.bytes().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    out.push(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    out
}

fn interpret(value: &Value) -> Option<Progress> {
    match value {
        Value::Object(map) => interpret_object(map),
        Value::Array(items) => count_subtasks(items),
        _ => None,
    }
}

fn interpret_object(map: &Map<String, Value>) -> Option<Progress> {
    if let Some(inner) = map.get("progress")
        && let Some(p) = interpret(inner)
    {
        return Some(p);
    }

    let total = first_count(map, TOTAL_KEYS);
    let completed = first_count(map, COMPLETED_KEYS);
    let listed = LIST_KEYS
        .iter()
        .filter_map(|k| map.get(*k).and_then(Value::as_array))
        .find_map(|items| count_subtasks(items));

    let total = total.or(listed.map(|p| p.total))?;
    let completed = completed
        .or(listed.map(|p| p.completed))
        .unwrap_or(0)
        .min(total);
    Some(Progress { total, completed })
}

fn count_subtasks(items: &[Value]) -> Option<Progress> {
    let mut total = 0u32;
    let mut completed = 0u32;
    for item in items {
        let Some(obj) = item.as_object() else {
            return None;
        };
        let done = match (obj.get("status"), obj.get("done"), obj.get("completed")) {
            (Some(Value::String(s)), _, _) => {
                DONE_STATUSES.contains(&s.trim().to_ascii_lowercase().as_str())
            }
            (_, Some(Value::Bool(b)), _) | (_, _, Some(Value::Bool(b))) => *b,
            _ => return None,
        };
        total = total.saturating_add(1);
        if done {
            completed = completed.saturating_add(1);
        }
    }
    (total > 0).then_some(Progress { total, completed })
}

fn first_count(map: &Map<String, Value>, keys: &[&str]) -> Option<u32> {
    keys.iter()
        .filter_map(|k| map.get(*k))
        .find_map(Value::as_u64)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
}
