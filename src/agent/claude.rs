#![forbid(unsafe_code)]

use std::path::Path;

use serde_json::{Value, json};

use crate::agent::BackendKind;
use crate::agent::stream::{Record, str_at};
use crate::agent::supervisor::Protocol;

/// Claude Code in print mode with `stream-json` on both stdin and stdout.
#[derive(Debug, Clone)]
pub struct ClaudeProtocol {
    executable: String,
}

impl ClaudeProtocol {
    #[must_use]
    pub fn new(executable: &str) -> Self {
        Self {
            executable: executable.to_owned(),
        }
    }
}

impl Protocol for ClaudeProtocol {
    fn kind(&self) -> BackendKind {
        BackendKind::Claude
    }

    fn executable(&self) -> &str {
        &self.executable
    }

    fn args(&self, _workspace: &Path, resume: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = [
            "-p",
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--include-partial-messages",
            "--verbose",
            "--dangerously-skip-permissions",
        ]
        .into_iter()
        .map(str::to_owned)
        .collect();
        if let Some(session) = resume {
            args.extend(["--resume".to_owned(), session.to_owned(), "--fork-session".to_owned()]);
        }
        args
    }

    fn stdin_payload(&self, prompt: &str) -> Vec<u8> {
        let turn = json!({
            "type": "user",
            "message": { "role": "user", "content": prompt },
        });
        let mut out = turn.to_string().into_bytes();
        out.push(b'\n');
        out
    }

    fn decode(&self, record: &Value) -> Vec<Record> {
        let mut out = Vec::new();
        if let Some(session) = str_at(record, "/session_id") {
            out.push(Record::Session(session.to_owned()));
        }

        match str_at(record, "/type").unwrap_or_default() {
            "system" => {
                if let Some(model) = str_at(record, "/model") {
                    out.push(Record::Model(model.to_owned()));
                }
            }
            "stream_event" => decode_stream_event(record, &mut out),
            "assistant" => {
                if let Some(model) = str_at(record, "/message/model") {
                    out.push(Record::Model(model.to_owned()));
                }
                let text = message_text(record);
                if !text.is_empty() {
                    out.push(Record::Message(text));
                }
            }
            "result" => {
                if record.get("is_error").and_then(Value::as_bool) == Some(true) {
                    let reason = str_at(record, "/result")
                        .or_else(|| str_at(record, "/subtype"))
                        .unwrap_or("claude reported an error");
                    out.push(Record::Error(reason.to_owned()));
                }
            }
            "error" => {
                let reason = str_at(record, "/error/message")
                    .or_else(|| str_at(record, "/message"))
                    .unwrap_or("claude reported an error");
                out.push(Record::Error(reason.to_owned()));
            }
            _ => {}
        }
        out
    }
}

fn decode_stream_event(record: &Value, out: &mut Vec<Record>) {
    match str_at(record, "/event/type").unwrap_or_default() {
        "message_start" => {
            out.push(Record::StreamStarted);
            if let Some(model) = str_at(record, "/event/message/model") {
                out.push(Record::Model(model.to_owned()));
            }
        }
        "content_block_delta" => match str_at(record, "/event/delta/type").unwrap_or_default() {
            "text_delta" => {
                if let Some(text) = str_at(record, "/event/delta/text") {
                    out.push(Record::Delta(text.to_owned()));
                }
            }
            "thinking_delta" => {
                if let Some(text) = str_at(record, "/event/delta/thinking") {
                    out.push(Record::Reasoning(text.to_owned()));
                }
            }
            _ => {}
        },
        _ => {}
    }
}

fn message_text(record: &Value) -> String {
    match record.pointer("/message/content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}
