// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `UpdatePairer` (spec §4.5) — stateful transformer turning raw model-update
//! deltas into `(rawUpdate, coalescedMessage?)` pairs. Accumulates text,
//! reasoning, and tool-call segments since the last emitted boundary;
//! emits a `CoalescedMessage` only when a turn boundary is observed.

use chrono::Utc;

use crate::types::{boundary_message_id, CoalescedMessage, MessageRole, ModelUpdate, StreamTriple, ThreadKey, ToolCallSummary, UpdateContent};

pub struct UpdatePairer {
    key: ThreadKey,
    sender_id: String,
    role: MessageRole,
    text: String,
    reasoning: String,
    tool_calls: Vec<ToolCallSummary>,
    boundary_seq: u64,
}

impl UpdatePairer {
    pub fn new(key: ThreadKey, sender_id: impl Into<String>) -> Self {
        Self {
            key,
            sender_id: sender_id.into(),
            role: MessageRole::Assistant,
            text: String::new(),
            reasoning: String::new(),
            tool_calls: Vec::new(),
            boundary_seq: 0,
        }
    }

    /// The author role a given `UpdateContent` belongs to, if any — `None`
    /// for content that doesn't carry a role of its own (reasoning, tool
    /// args, markers).
    fn content_role(content: &UpdateContent) -> Option<MessageRole> {
        match content {
            UpdateContent::TextDelta(_) => Some(MessageRole::Assistant),
            UpdateContent::ToolCallStart { .. } | UpdateContent::ToolResult { .. } => Some(MessageRole::Tool),
            _ => None,
        }
    }

    /// Feed one raw update; returns the `StreamTriple` it produces. A
    /// boundary is reached when a `StreamComplete`/`Error` marker is
    /// observed, when a tool-call group closes (`ToolResult`), or when the
    /// role of subsequent content changes (spec §4.5: "the role/author of
    /// subsequent content changes, e.g. assistant -> tool") — the raw update
    /// is always carried in the first slot for token-level consumers.
    pub fn push(&mut self, update: ModelUpdate) -> StreamTriple {
        // A role change closes the turn already in progress before this
        // update's content folds into a fresh accumulation.
        let role_boundary =
            update.contents.iter().find_map(Self::content_role).is_some_and(|new_role| self.has_content() && new_role != self.role);
        let role_flushed = if role_boundary { self.flush() } else { None };

        let mut boundary = false;
        for content in &update.contents {
            if let Some(new_role) = Self::content_role(content) {
                self.role = new_role;
            }
            match content {
                UpdateContent::TextDelta(s) => self.text.push_str(s),
                UpdateContent::ReasoningDelta(s) => self.reasoning.push_str(s),
                UpdateContent::ToolCallStart { call_id, tool_name } => {
                    self.tool_calls.push(ToolCallSummary {
                        call_id: call_id.clone(),
                        tool_name: tool_name.clone(),
                        args: serde_json::Value::Null,
                        output: None,
                        is_error: false,
                    });
                }
                UpdateContent::ToolCallArg { .. } => {}
                UpdateContent::ToolResult { call_id, output, is_error, .. } => {
                    if let Some(tc) = self.tool_calls.iter_mut().find(|tc| &tc.call_id == call_id) {
                        tc.output = Some(output.clone());
                        tc.is_error = *is_error;
                    }
                    boundary = true;
                }
                UpdateContent::ToolApprovalRequested { .. } => {}
                UpdateContent::StreamComplete | UpdateContent::Error(_) => {
                    boundary = true;
                }
            }
        }

        let pending_message_id = Some(boundary_message_id(&self.key, self.boundary_seq + 1));
        let coalesced = if boundary { self.flush() } else { role_flushed };
        StreamTriple { key: self.key.clone(), update, coalesced, pending_message_id }
    }

    fn has_content(&self) -> bool {
        !self.text.is_empty() || !self.reasoning.is_empty() || !self.tool_calls.is_empty()
    }

    /// Emit the accumulated content as a `CoalescedMessage`, resetting the
    /// accumulator. Returns `None` if nothing was accumulated (spec §4.5:
    /// "empty accumulation at a boundary yields no coalesced message").
    fn flush(&mut self) -> Option<CoalescedMessage> {
        if self.text.is_empty() && self.reasoning.is_empty() && self.tool_calls.is_empty() {
            return None;
        }
        self.boundary_seq += 1;
        let message_id = boundary_message_id(&self.key, self.boundary_seq);
        let msg = CoalescedMessage {
            role: self.role,
            text: std::mem::take(&mut self.text),
            reasoning: std::mem::take(&mut self.reasoning),
            tool_calls: std::mem::take(&mut self.tool_calls),
            message_id,
            sender_id: self.sender_id.clone(),
            timestamp: Utc::now(),
        };
        self.role = MessageRole::Assistant;
        Some(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ThreadKey {
        ThreadKey::new("tg", 7, 42, "A")
    }

    #[test]
    fn text_deltas_then_stream_complete_yields_one_coalesced_message() {
        let mut pairer = UpdatePairer::new(key(), "alice");
        let t1 = pairer.push(ModelUpdate::new(1, UpdateContent::TextDelta("hi ".into())));
        assert!(t1.coalesced.is_none());
        let t2 = pairer.push(ModelUpdate::new(2, UpdateContent::TextDelta("alice".into())));
        assert!(t2.coalesced.is_none());
        let t3 = pairer.push(ModelUpdate::stream_complete(3));
        let msg = t3.coalesced.expect("boundary message");
        assert_eq!(msg.text, "hi alice");
        assert_eq!(msg.role, MessageRole::Assistant);
    }

    #[test]
    fn empty_accumulation_at_boundary_yields_no_message() {
        let mut pairer = UpdatePairer::new(key(), "alice");
        let t = pairer.push(ModelUpdate::stream_complete(1));
        assert!(t.coalesced.is_none());
    }

    #[test]
    fn reasoning_only_turn_still_emits_coalesced_message_with_stable_id() {
        let mut pairer = UpdatePairer::new(key(), "alice");
        pairer.push(ModelUpdate::new(1, UpdateContent::ReasoningDelta("thinking...".into())));
        let t = pairer.push(ModelUpdate::stream_complete(2));
        let msg = t.coalesced.expect("boundary message");
        assert_eq!(msg.reasoning, "thinking...");
        assert!(msg.text.is_empty());
        assert_eq!(msg.message_id, boundary_message_id(&key(), 1));
    }

    #[test]
    fn tool_result_closes_the_tool_call_group() {
        let mut pairer = UpdatePairer::new(key(), "alice");
        pairer.push(ModelUpdate::new(1, UpdateContent::ToolCallStart { call_id: "c1".into(), tool_name: "read_file".into() }));
        let t = pairer.push(ModelUpdate::new(
            2,
            UpdateContent::ToolResult { call_id: "c1".into(), tool_name: "read_file".into(), output: "contents".into(), is_error: false },
        ));
        let msg = t.coalesced.expect("tool-call group closes the turn");
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].output.as_deref(), Some("contents"));
    }

    #[test]
    fn accumulator_resets_after_each_boundary() {
        let mut pairer = UpdatePairer::new(key(), "alice");
        pairer.push(ModelUpdate::new(1, UpdateContent::TextDelta("first".into())));
        let t1 = pairer.push(ModelUpdate::stream_complete(2));
        assert_eq!(t1.coalesced.unwrap().text, "first");

        pairer.push(ModelUpdate::new(3, UpdateContent::TextDelta("second".into())));
        let t2 = pairer.push(ModelUpdate::stream_complete(4));
        assert_eq!(t2.coalesced.unwrap().text, "second");
    }

    #[test]
    fn error_marker_is_also_a_boundary() {
        let mut pairer = UpdatePairer::new(key(), "alice");
        pairer.push(ModelUpdate::new(1, UpdateContent::TextDelta("partial".into())));
        let t = pairer.push(ModelUpdate::new(2, UpdateContent::Error("boom".into())));
        assert_eq!(t.coalesced.unwrap().text, "partial");
    }

    #[test]
    fn raw_update_is_always_carried_in_first_slot() {
        let mut pairer = UpdatePairer::new(key(), "alice");
        let t = pairer.push(ModelUpdate::new(1, UpdateContent::TextDelta("x".into())));
        assert!(matches!(t.update.contents[0], UpdateContent::TextDelta(ref s) if s == "x"));
    }

    #[test]
    fn role_change_flushes_the_assistant_message_before_a_tool_call() {
        let mut pairer = UpdatePairer::new(key(), "alice");
        pairer.push(ModelUpdate::new(1, UpdateContent::TextDelta("checking that for you".into())));
        let t = pairer.push(ModelUpdate::new(2, UpdateContent::ToolCallStart { call_id: "c1".into(), tool_name: "read_file".into() }));
        let msg = t.coalesced.expect("assistant -> tool role change is a boundary");
        assert_eq!(msg.role, MessageRole::Assistant);
        assert_eq!(msg.text, "checking that for you");
        assert!(msg.tool_calls.is_empty(), "the tool call belongs to the next turn, not the flushed one");
    }

    #[test]
    fn pending_message_id_matches_the_eventual_coalesced_message_id() {
        let mut pairer = UpdatePairer::new(key(), "alice");
        let t1 = pairer.push(ModelUpdate::new(1, UpdateContent::TextDelta("hi".into())));
        let pending = t1.pending_message_id.expect("pending id assigned before the boundary");
        let t2 = pairer.push(ModelUpdate::stream_complete(2));
        assert_eq!(t2.coalesced.unwrap().message_id, pending);
    }
}
