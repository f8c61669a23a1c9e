#![forbid(unsafe_code)]

use std::path::Path;

use serde_json::Value;

use crate::agent::BackendKind;
use crate::agent::stream::{Record, str_at};
use crate::agent::supervisor::Protocol;

/// `codex exec --json`, prompt read from stdin (`-`).
///
/// Codex takes the prompt as plain text, not as a JSON user turn.
#[derive(Debug, Clone)]
pub struct CodexProtocol {
    executable: String,
}

impl CodexProtocol {
    #[must_use]
    pub fn new(executable: &str) -> Self {
        Self {
            executable: executable.to_owned(),
        }
    }
}

impl Protocol for CodexProtocol {
    fn kind(&self) -> BackendKind {
        BackendKind::Codex
    }

    fn executable(&self) -> &str {
        &self.executable
    }

    fn args(&self, workspace: &Path, resume: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "exec".to_owned(),
            "--json".to_owned(),
            "--dangerously-bypass-approvals-and-sandbox".to_owned(),
            "--color".to_owned(),
            "never".to_owned(),
            "-C".to_owned(),
            workspace.to_string_lossy().into_owned(),
        ];
        if let Some(session) = resume {
            args.push("resume".to_owned());
            args.push(session.to_owned());
        }
        args.push("-".to_owned());
        args
    }

    fn stdin_payload(&self, prompt: &str) -> Vec<u8> {
        let mut out = prompt.as_bytes().to_vec();
        out.push(b'\n');
        out
    }

    fn decode(&self, record: &Value) -> Vec<Record> {
        let mut out = Vec::new();
        match str_at(record, "/type").unwrap_or_default() {
            "thread.started" => {
                if let Some(thread) = str_at(record, "/thread_id") {
                    out.push(Record::Session(thread.to_owned()));
                }
            }
            "turn.started" => out.push(Record::StreamStarted),
            "item.completed" => {
                let kind = str_at(record, "/item/type")
                    .or_else(|| str_at(record, "/item/item_type"))
                    .unwrap_or_default();
                let text = str_at(record, "/item/text").unwrap_or_default();
                match kind {
                    "agent_message" | "assistant_message" if !text.is_empty() => {
                        out.push(Record::Message(text.to_owned()));
                    }
                    "reasoning" if !text.is_empty() => out.push(Record::Reasoning(text.to_owned())),
                    "error" if !text.is_empty() => out.push(Record::Error(text.to_owned())),
                    _ => {}
                }
            }
            "turn.failed" => {
                let reason = str_at(record, "/error/message").unwrap_or("codex turn failed");
                out.push(Record::Error(reason.to_owned()));
            }
            "error" => {
                let reason = str_at(record, "/message").unwrap_or("codex reported an error");
                out.push(Record::Error(reason.to_owned()));
            }
            _ => {
                if let Some(model) = str_at(record, "/model") {
                    out.push(Record::Model(model.to_owned()));
                }
            }
        }
        out
    }
}
