// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! A minimal stdin/stdout [`PromptSource`]/[`Surface`] pair for local
//! testing without standing up a bot token or webhook. One line of stdin is
//! one prompt; deltas print to stdout as they stream, matching the
//! headless/CI texture of the CLI's own stdin reading rather than the full
//! TUI.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::prompt::PromptSource;
use crate::surface::Surface;
use crate::types::{Prompt, StreamTriple, ThreadKey, UpdateContent};

pub const TERMINAL_SURFACE_ID: &str = "terminal";

/// Single-thread local session: one conversation, one thread, both fixed.
const CONVERSATION_ID: i64 = 0;
const THREAD_ID: i64 = 0;

pub struct TerminalSurface {
    agent_id: String,
    reader: Mutex<Box<dyn AsyncBufRead + Send + Unpin>>,
    closed: AtomicBool,
}

impl TerminalSurface {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self::from_reader(agent_id, BufReader::new(tokio::io::stdin()))
    }

    /// Construct over an arbitrary reader — used by tests to stand in for
    /// stdin.
    pub fn from_reader(agent_id: impl Into<String>, reader: impl AsyncBufRead + Send + Unpin + 'static) -> Self {
        Self { agent_id: agent_id.into(), reader: Mutex::new(Box::new(reader)), closed: AtomicBool::new(false) }
    }
}

#[async_trait]
impl PromptSource for TerminalSurface {
    fn surface_id(&self) -> &str {
        TERMINAL_SURFACE_ID
    }

    async fn next_prompts(&self, cancel: &CancellationToken) -> Vec<Prompt> {
        if self.closed.load(Ordering::SeqCst) {
            // Stdin hit EOF already; a long-poll surface with nothing left
            // to yield just idles until the ingress loop is cancelled.
            cancel.cancelled().await;
            return Vec::new();
        }

        let mut line = String::new();
        let read = {
            let mut reader = self.reader.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => return Vec::new(),
                read = reader.read_line(&mut line) => read,
            }
        };

        match read {
            Ok(0) => {
                self.closed.store(true, Ordering::SeqCst);
                Vec::new()
            }
            Ok(_) => {
                let body = line.trim_end_matches(['\n', '\r']).to_string();
                if body.is_empty() {
                    return Vec::new();
                }
                vec![Prompt {
                    surface_id: TERMINAL_SURFACE_ID.into(),
                    conversation_id: CONVERSATION_ID,
                    thread_id: Some(THREAD_ID),
                    agent_id: self.agent_id.clone(),
                    sender_id: "local".into(),
                    body,
                    timestamp: Utc::now(),
                    reply_target: None,
                    message_id: uuid::Uuid::new_v4().to_string(),
                    thread_name_hint: Some("terminal".into()),
                }]
            }
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl Surface for TerminalSurface {
    fn id(&self) -> &str {
        TERMINAL_SURFACE_ID
    }

    async fn provision_thread(&self, _conversation_id: i64, _name: &str, _cancel: &CancellationToken) -> anyhow::Result<i64> {
        Ok(THREAD_ID)
    }

    async fn thread_exists(&self, _conversation_id: i64, _thread_id: i64, _cancel: &CancellationToken) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn begin_turn(&self, _key: &ThreadKey) {}

    async fn emit(&self, triple: &StreamTriple) {
        let mut stdout = tokio::io::stdout();
        for content in &triple.update.contents {
            let rendered = match content {
                UpdateContent::TextDelta(text) => text.clone(),
                UpdateContent::ReasoningDelta(_) => continue,
                UpdateContent::ToolCallStart { tool_name, .. } => format!("\n[tool: {tool_name}]\n"),
                UpdateContent::ToolResult { tool_name, is_error, .. } => {
                    format!("[{tool_name}{}]\n", if *is_error { " failed" } else { " done" })
                }
                UpdateContent::ToolCallArg { .. } | UpdateContent::ToolApprovalRequested { .. } => continue,
                UpdateContent::StreamComplete | UpdateContent::Error(_) => continue,
            };
            let _ = stdout.write_all(rendered.as_bytes()).await;
        }
        let _ = stdout.flush().await;
    }

    async fn end_turn(&self, _key: &ThreadKey) {
        let mut stdout = tokio::io::stdout();
        let _ = stdout.write_all(b"\n").await;
        let _ = stdout.flush().await;
    }
}

/// Exposed for callers that want to detect an EOF'd terminal session
/// without going through `thread_exists`.
pub fn is_tty() -> bool {
    use io::IsTerminal;
    io::stdin().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn reads_one_line_as_one_prompt() {
        let surface = TerminalSurface::from_reader("agent", Cursor::new(b"hello there\n".to_vec()));
        let cancel = CancellationToken::new();
        let prompts = surface.next_prompts(&cancel).await;
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].body, "hello there");
        assert_eq!(prompts[0].thread_id, Some(THREAD_ID));
    }

    #[tokio::test]
    async fn blank_lines_produce_no_prompt() {
        let surface = TerminalSurface::from_reader("agent", Cursor::new(b"\n".to_vec()));
        let cancel = CancellationToken::new();
        assert!(surface.next_prompts(&cancel).await.is_empty());
    }

    #[tokio::test]
    async fn eof_marks_surface_closed_and_thread_exists_false() {
        let surface = TerminalSurface::from_reader("agent", Cursor::new(Vec::new()));
        let cancel = CancellationToken::new();
        assert!(surface.next_prompts(&cancel).await.is_empty());
        assert!(!surface.thread_exists(0, 0, &cancel).await);
    }

    #[tokio::test]
    async fn provision_thread_always_returns_the_fixed_thread_id() {
        let surface = TerminalSurface::from_reader("agent", Cursor::new(Vec::new()));
        let cancel = CancellationToken::new();
        let id = surface.provision_thread(0, "ignored", &cancel).await.unwrap();
        assert_eq!(id, THREAD_ID);
    }
}
