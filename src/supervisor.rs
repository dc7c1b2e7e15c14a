//! Process supervision: one subprocess per worker activation.
//!
//! The supervisor launches the worker CLI, parses its newline-delimited JSON
//! output, samples elapsed time while the process lives, classifies the exit,
//! and resolves with the turn's aggregated text. It holds no state between
//! calls; concurrent activations never interfere.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::instance::{InstanceKey, ProcessHandle, WorkerStatus};
use crate::observer::FleetObserver;
use crate::registry::Registry;

/// Everything needed to launch one activation.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Transcript file preserving the worker's conversational state.
    pub session_file: PathBuf,
    /// Model identifier.
    pub model: String,
    /// Comma-delimited tool names.
    pub capabilities: String,
    /// System prompt override.
    pub system_prompt: String,
    /// The task text, passed as the final argument.
    pub task: String,
}

/// Seam for starting worker subprocesses; tests substitute scripted fakes.
pub trait WorkerLauncher: Send + Sync {
    /// Start a subprocess for the given activation.
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Child>;
}

/// Launches the real worker CLI in non-interactive structured-output mode.
pub struct CliLauncher {
    executable: PathBuf,
}

impl CliLauncher {
    /// Create a launcher for the given executable.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

impl WorkerLauncher for CliLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Child> {
        Command::new(&self.executable)
            .arg("--mode")
            .arg("json")
            .arg("-p")
            .arg("--session")
            .arg(&spec.session_file)
            // Workers must not load extensions of their own, or they could
            // recursively spawn more workers.
            .arg("--no-extensions")
            .arg("--model")
            .arg(&spec.model)
            .arg("--tools")
            .arg(&spec.capabilities)
            .arg("--thinking")
            .arg("off")
            .arg("--append-system-prompt")
            .arg(&spec.system_prompt)
            .arg(&spec.task)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Inner payload of a `message_update` event.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AssistantMessageEvent {
    #[serde(rename = "text_delta")]
    TextDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(other)]
    Other,
}

/// One line of the worker's stdout protocol.
///
/// The union is closed over the shapes the core reacts to; everything else
/// lands in `Other` and is ignored without failing the stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "message_update")]
    MessageUpdate {
        #[serde(rename = "assistantMessageEvent", default)]
        event: Option<AssistantMessageEvent>,
    },
    #[serde(rename = "tool_execution_start")]
    ToolExecutionStart,
    #[serde(other)]
    Other,
}

/// Parse one protocol line; malformed JSON is discarded (best-effort stream).
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    serde_json::from_str(line).ok()
}

/// Accumulates raw output and yields complete lines.
///
/// The last, possibly incomplete, line is retained across reads and prefixed
/// to the next chunk; `take_rest` surfaces it once the stream ends.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and drain every complete line it closes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }

    /// Take the retained partial line, if it holds anything but whitespace.
    pub fn take_rest(&mut self) -> Option<String> {
        if self.buf.iter().all(u8::is_ascii_whitespace) {
            self.buf.clear();
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(rest)
    }
}

enum StreamChunk {
    Out(Vec<u8>),
    Err(Vec<u8>),
}

/// Run one activation of the instance at `key` to completion.
///
/// Resolves with the concatenation of all output chunks collected during this
/// activation; a launch failure resolves immediately with the diagnostic.
/// Cancelling `cancel` requests termination of the live subprocess — the
/// activation still resolves only once the process actually exits.
pub async fn supervise(
    registry: &Registry,
    key: &InstanceKey,
    launcher: &dyn WorkerLauncher,
    spec: LaunchSpec,
    observer: &dyn FleetObserver,
    cancel: CancellationToken,
    elapsed_tick: Duration,
) -> String {
    let mut child = match launcher.launch(&spec) {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(worker = %key, error = %e, "Failed to launch worker");
            let diag = format!("Error: {e}");
            let elapsed = registry
                .update(key, |inst| {
                    inst.output_chunks.push(diag.clone());
                    inst.status = WorkerStatus::Error;
                    inst.process = None;
                    inst.elapsed_ms
                })
                .await
                .unwrap_or(0);
            observer.status_change(key, WorkerStatus::Error, elapsed);
            return diag;
        }
    };

    tracing::debug!(worker = %key, "Worker activation started");

    // The same token serves the caller's cancellation and registry-driven
    // termination (remove / clear_all) via the stored process handle.
    let term = cancel.child_token();
    let _ = registry
        .update(key, |inst| inst.process = Some(ProcessHandle::new(term.clone())))
        .await;

    let (tx, mut rx) = mpsc::channel::<StreamChunk>(64);
    if let Some(mut stdout) = child.stdout.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(StreamChunk::Out(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
    if let Some(mut stderr) = child.stderr.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(StreamChunk::Err(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
    drop(tx);

    let start = Instant::now();
    let mut ticker = tokio::time::interval(elapsed_tick);
    let mut lines = LineBuffer::default();
    let mut kill_sent = false;

    loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Some(StreamChunk::Out(bytes)) => {
                    for line in lines.push(&bytes) {
                        handle_line(registry, key, observer, &line).await;
                    }
                }
                Some(StreamChunk::Err(bytes)) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    if !text.trim().is_empty() {
                        let _ = registry
                            .update(key, |inst| inst.output_chunks.push(text.clone()))
                            .await;
                        observer.text_delta(key, &text);
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                let elapsed = start.elapsed().as_millis() as u64;
                let _ = registry.update(key, |inst| inst.elapsed_ms = elapsed).await;
            }
            _ = term.cancelled(), if !kill_sent => {
                kill_sent = true;
                tracing::debug!(worker = %key, "Termination requested");
                if let Err(e) = child.start_kill() {
                    tracing::warn!(worker = %key, error = %e, "Failed to signal worker");
                }
            }
        }
    }

    // Whatever remained after the final newline is one last complete line.
    if let Some(rest) = lines.take_rest() {
        handle_line(registry, key, observer, &rest).await;
    }

    let exit = child.wait().await;
    let elapsed = start.elapsed().as_millis() as u64;
    let status = match &exit {
        Ok(s) if s.success() => WorkerStatus::Done,
        Ok(_) => WorkerStatus::Error,
        Err(e) => {
            tracing::warn!(worker = %key, error = %e, "Failed to reap worker process");
            WorkerStatus::Error
        }
    };

    let result = registry
        .update(key, |inst| {
            inst.elapsed_ms = elapsed;
            inst.status = status;
            inst.process = None;
            inst.output()
        })
        .await
        .unwrap_or_default();

    tracing::info!(worker = %key, %status, elapsed_ms = elapsed, "Worker activation finished");
    observer.status_change(key, status, elapsed);

    result
}

async fn handle_line(
    registry: &Registry,
    key: &InstanceKey,
    observer: &dyn FleetObserver,
    line: &str,
) {
    if line.trim().is_empty() {
        return;
    }
    let Some(event) = parse_line(line) else {
        return;
    };
    match event {
        StreamEvent::MessageUpdate {
            event: Some(AssistantMessageEvent::TextDelta { delta }),
        } => {
            let _ = registry
                .update(key, |inst| inst.output_chunks.push(delta.clone()))
                .await;
            observer.text_delta(key, &delta);
        }
        StreamEvent::ToolExecutionStart => {
            let _ = registry
                .update(key, |inst| inst.tool_invocations += 1)
                .await;
            observer.tool_start(key);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_splits_on_newlines() {
        let mut buf = LineBuffer::default();
        assert_eq!(buf.push(b"one\ntwo\n"), vec!["one", "two"]);
        assert!(buf.take_rest().is_none());
    }

    #[test]
    fn line_buffer_retains_partial_line_across_reads() {
        let mut buf = LineBuffer::default();
        assert_eq!(buf.push(b"first\nsec"), vec!["first"]);
        assert_eq!(buf.push(b"ond\nthi"), vec!["second"]);
        assert_eq!(buf.take_rest().as_deref(), Some("thi"));
        assert!(buf.take_rest().is_none());
    }

    #[test]
    fn line_buffer_ignores_trailing_whitespace_rest() {
        let mut buf = LineBuffer::default();
        buf.push(b"line\n  ");
        assert!(buf.take_rest().is_none());
    }

    #[test]
    fn parse_text_delta_event() {
        let line = r#"{"type":"message_update","assistantMessageEvent":{"type":"text_delta","delta":"hi"}}"#;
        match parse_line(line) {
            Some(StreamEvent::MessageUpdate {
                event: Some(AssistantMessageEvent::TextDelta { delta }),
            }) => assert_eq!(delta, "hi"),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parse_tool_start_event() {
        let line = r#"{"type":"tool_execution_start","toolName":"read"}"#;
        assert!(matches!(
            parse_line(line),
            Some(StreamEvent::ToolExecutionStart)
        ));
    }

    #[test]
    fn parse_unknown_tag_is_other() {
        let line = r#"{"type":"turn_end"}"#;
        assert!(matches!(parse_line(line), Some(StreamEvent::Other)));
    }

    #[test]
    fn parse_message_update_without_delta_payload() {
        let line = r#"{"type":"message_update"}"#;
        assert!(matches!(
            parse_line(line),
            Some(StreamEvent::MessageUpdate { event: None })
        ));

        let line = r#"{"type":"message_update","assistantMessageEvent":{"type":"thinking"}}"#;
        assert!(matches!(
            parse_line(line),
            Some(StreamEvent::MessageUpdate {
                event: Some(AssistantMessageEvent::Other)
            })
        ));
    }

    #[test]
    fn parse_garbage_is_discarded() {
        assert!(parse_line("not json at all").is_none());
        assert!(parse_line("{\"type\":").is_none());
    }
}
