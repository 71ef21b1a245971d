//! Last-resort external CLI fallback.
//!
//! When the API path is fully quota-exhausted, a separately installed CLI
//! client sharing the same free-tier identity can still answer. This path is
//! explicitly gated by config and refuses any payload carrying non-text
//! content, so modality-bearing requests are never silently flattened.

mod prompt;

use crate::config::FallbackConfig;
use crate::dispatch::body::OutboundBody;
use crate::utils::now_ms;
use castor_schema::{ChatChunk, ChatChunkDelta, ChatCompletion};
use serde_json::Value;
use std::collections::VecDeque;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use prompt::build_prompt;

/// A fallback answer reshaped to match the original request's mode.
#[derive(Debug)]
pub enum FallbackReply {
    /// Structurally valid non-streaming completion object.
    Completion(Value),
    /// SSE data lines: two content chunks plus the `[DONE]` terminator.
    Stream(Vec<String>),
}

#[derive(Debug)]
pub enum FallbackOutcome {
    Success(FallbackReply),
    Failed(String),
    /// The caller's own request was cancelled; the subprocess was killed.
    Aborted,
}

pub struct CliFallback {
    cfg: FallbackConfig,
}

impl CliFallback {
    pub fn new(cfg: FallbackConfig) -> Self {
        Self { cfg }
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// Run the CLI against a prompt condensed from the request's messages.
    pub async fn run(
        &self,
        body: &OutboundBody,
        cancel: Option<&CancellationToken>,
    ) -> FallbackOutcome {
        let messages = body.messages();
        let Some(prompt) = build_prompt(&messages) else {
            return FallbackOutcome::Failed("no usable prompt in request".to_string());
        };

        info!(cli = %self.cfg.cli_path.display(), "invoking CLI fallback");
        let mut child = match Command::new(&self.cfg.cli_path)
            .arg("-p")
            .arg(&prompt)
            .arg("--output-format")
            .arg("json")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "failed to spawn CLI fallback");
                return FallbackOutcome::Failed(format!("spawn failed: {e}"));
            }
        };

        let Some(mut stdout) = child.stdout.take() else {
            let _ = child.kill().await;
            return FallbackOutcome::Failed("CLI stdout was not captured".to_string());
        };

        let mut buffer = BoundedBuffer::new(self.cfg.max_output_bytes);
        let mut chunk = [0u8; 8192];
        let deadline = tokio::time::sleep(self.cfg.timeout);
        tokio::pin!(deadline);

        loop {
            let cancelled = async {
                match cancel {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                read = stdout.read(&mut chunk) => match read {
                    Ok(0) => break,
                    Ok(n) => buffer.push(&chunk[..n]),
                    Err(e) => {
                        let _ = child.kill().await;
                        return FallbackOutcome::Failed(format!("read error: {e}"));
                    }
                },
                () = &mut deadline => {
                    warn!(timeout_ms = self.cfg.timeout.as_millis(), "CLI fallback timed out");
                    let _ = child.kill().await;
                    return FallbackOutcome::Failed("CLI fallback timed out".to_string());
                }
                () = cancelled => {
                    debug!("caller cancelled; killing CLI fallback");
                    let _ = child.kill().await;
                    return FallbackOutcome::Aborted;
                }
            }
        }

        match child.wait().await {
            Ok(status) if status.success() => {}
            Ok(status) => {
                return FallbackOutcome::Failed(format!("CLI exited with {status}"));
            }
            Err(e) => return FallbackOutcome::Failed(format!("wait failed: {e}")),
        }

        let stdout_text = String::from_utf8_lossy(buffer.as_slice()).into_owned();
        let Some(answer) = extract_answer(&stdout_text) else {
            return FallbackOutcome::Failed("no textual result in CLI output".to_string());
        };

        let model = body.model().unwrap_or("qwen3-coder-plus").to_string();
        FallbackOutcome::Success(reshape(&answer, &model, body.is_streaming()))
    }
}

/// Front-dropping byte buffer: memory stays bounded no matter how chatty the
/// subprocess is, at the cost of losing the oldest output first.
struct BoundedBuffer {
    data: VecDeque<u8>,
    max: usize,
}

impl BoundedBuffer {
    fn new(max: usize) -> Self {
        BoundedBuffer {
            data: VecDeque::new(),
            max,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.data.extend(bytes);
        while self.data.len() > self.max {
            self.data.pop_front();
        }
    }

    fn as_slice(&mut self) -> &[u8] {
        self.data.make_contiguous()
    }
}

/// Find the final textual result in the CLI's JSON event array.
///
/// Primary: an event with `type == "result"`. Secondary heuristic: the last
/// message-shaped event with textual content.
fn extract_answer(stdout: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(stdout.trim()).ok()?;
    let events: Vec<Value> = match parsed {
        Value::Array(events) => events,
        single @ Value::Object(_) => vec![single],
        _ => return None,
    };

    for event in &events {
        if event.get("type").and_then(Value::as_str) == Some("result") {
            if let Some(text) = event.get("result").and_then(Value::as_str) {
                if !text.is_empty() {
                    return Some(text.to_string());
                }
            }
        }
    }

    events.iter().rev().find_map(message_text)
}

fn message_text(event: &Value) -> Option<String> {
    let content = event.get("message")?.get("content")?;
    match content {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(parts) => {
            let text: Vec<&str> = parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            if text.is_empty() {
                None
            } else {
                Some(text.join("\n"))
            }
        }
        _ => None,
    }
}

/// Shape the answer like a real completion, honoring the request's mode.
fn reshape(answer: &str, model: &str, streaming: bool) -> FallbackReply {
    let id = format!("chatcmpl-{}", Uuid::new_v4());
    let created = now_ms() / 1000;

    if !streaming {
        let completion =
            ChatCompletion::of_text(id, created, model.to_string(), answer.to_string());
        return FallbackReply::Completion(
            serde_json::to_value(completion).expect("completion serializes"),
        );
    }

    let content_chunk = ChatChunk::of_delta(
        &id,
        created,
        model,
        ChatChunkDelta {
            role: Some("assistant".to_string()),
            content: Some(answer.to_string()),
            ..ChatChunkDelta::default()
        },
    );
    let stop_chunk = ChatChunk::terminator(&id, created, model);

    FallbackReply::Stream(vec![
        format!(
            "data: {}",
            serde_json::to_string(&content_chunk).expect("chunk serializes")
        ),
        format!(
            "data: {}",
            serde_json::to_string(&stop_chunk).expect("chunk serializes")
        ),
        "data: [DONE]".to_string(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_buffer_drops_from_the_front() {
        let mut buf = BoundedBuffer::new(8);
        buf.push(b"0123456789");
        assert_eq!(buf.as_slice(), b"23456789");
        buf.push(b"ab");
        assert_eq!(buf.as_slice(), b"456789ab");
    }

    #[test]
    fn result_event_wins_over_messages() {
        let out = r#"[
            {"type":"assistant","message":{"content":"thinking..."}},
            {"type":"result","result":"final answer"}
        ]"#;
        assert_eq!(extract_answer(out).as_deref(), Some("final answer"));
    }

    #[test]
    fn message_events_are_the_secondary_heuristic() {
        let out = r#"[
            {"type":"assistant","message":{"content":[{"type":"text","text":"part 1"}]}},
            {"type":"assistant","message":{"content":"the answer"}}
        ]"#;
        assert_eq!(extract_answer(out).as_deref(), Some("the answer"));
    }

    #[test]
    fn garbage_output_yields_none() {
        assert!(extract_answer("not json").is_none());
        assert!(extract_answer("[]").is_none());
        assert!(extract_answer(r#"[{"type":"result","result":""}]"#).is_none());
    }

    #[test]
    fn reshape_matches_request_mode() {
        let FallbackReply::Completion(v) = reshape("hi", "m", false) else {
            panic!("expected completion");
        };
        assert_eq!(v["object"], "chat.completion");
        assert_eq!(v["choices"][0]["message"]["content"], "hi");

        let FallbackReply::Stream(lines) = reshape("hi", "m", true) else {
            panic!("expected stream");
        };
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("data: "));
        assert_eq!(lines[2], "data: [DONE]");
        let chunk: Value =
            serde_json::from_str(lines[0].trim_start_matches("data: ")).expect("chunk json");
        assert_eq!(chunk["choices"][0]["delta"]["content"], "hi");
    }
}
