// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use sven_config::AgentMode;
use sven_tools::{events::TodoItem, ToolCall};

/// Events emitted by the agent during a single turn.
/// Consumers (CI runner, TUI) subscribe to these to drive their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A complete text response from the model (after streaming finishes)
    TextComplete(String),
    /// A thinking/reasoning chunk from the model (extended thinking API).
    /// Consumers should accumulate deltas and finalise them into a Thinking
    /// segment when the model signals the end of the reasoning block.
    ThinkingDelta(String),
    /// A complete thinking/reasoning block (accumulated from ThinkingDelta events).
    ThinkingComplete(String),
    /// The model has requested a tool call
    ToolCallStarted(ToolCall),
    /// A tool call finished
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// A tool call does not match the approval whitelist and is waiting for
    /// an operator decision before it runs. The agent loop blocks on this
    /// specific call (sibling calls in the same batch still execute) until
    /// the approval gate resolves it.
    ToolApprovalRequested {
        call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    /// Context was compacted; statistics for the UI
    ContextCompacted {
        tokens_before: usize,
        tokens_after: usize,
        strategy: CompactionStrategyUsed,
        /// Agentic-loop round at which compaction ran (0 = pre-submit).
        turn: u32,
    },
    /// Current token usage update
    TokenUsage {
        input: u32,
        output: u32,
        /// Tokens served from the provider's prompt cache this turn.
        cache_read: u32,
        /// Tokens written into the provider's prompt cache this turn.
        cache_write: u32,
        /// Running total of cache-read tokens for the whole session.
        cache_read_total: u32,
        /// Running total of cache-write tokens for the whole session.
        cache_write_total: u32,
        /// Context window size for the active model.
        max_tokens: usize,
    },
    /// The agent has finished processing the current user turn
    TurnComplete,
    /// The current turn was cancelled mid-stream. Any text already streamed
    /// has been committed to session history as a partial assistant message;
    /// `partial_text` carries the same content for consumers that render
    /// deltas separately from history.
    Aborted { partial_text: String },
    /// A recoverable error occurred
    Error(String),
    /// The todo list was updated
    TodoUpdate(Vec<TodoItem>),
    /// The agent mode was changed
    ModeChanged(AgentMode),
    /// The agent is asking the user a question (id links to QuestionAnswer)
    Question { id: String, questions: Vec<String> },
    /// Answer to a previous Question event
    QuestionAnswer { id: String, answer: String },
}

/// Which compaction path actually ran, reported alongside `ContextCompacted`
/// so consumers (TUI, logs) can distinguish a clean LLM-summarized compaction
/// from the deterministic emergency fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategyUsed {
    /// Rolling compaction using the structured-summary prompt.
    Structured,
    /// Rolling compaction using the narrative-summary prompt.
    Narrative,
    /// Deterministic drop-oldest-messages fallback; no model call made.
    Emergency,
}

impl std::fmt::Display for CompactionStrategyUsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Structured => "structured",
            Self::Narrative => "narrative",
            Self::Emergency => "emergency",
        };
        f.write_str(s)
    }
}
