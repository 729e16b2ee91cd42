// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Translation from engine wire types (`sven_engine::{CoalescedMessage,
//! StreamTriple}`) into store types. A local frontend (e.g. the TUI, wired
//! directly to an in-process `sven_engine::Engine`) consumes these
//! directly; a remote frontend gets the same shapes over JSON and decodes
//! into the identical store types.

use sven_engine::{CoalescedMessage, MessageRole as EngineMessageRole, StreamTriple, ToolCallSummary as EngineToolCallSummary, UpdateContent};

use crate::store::action::Action;
use crate::store::state::{ClientMessage, MessageRole, ToolCallSummary, TopicId};

impl From<EngineMessageRole> for MessageRole {
    fn from(role: EngineMessageRole) -> Self {
        match role {
            EngineMessageRole::User => MessageRole::User,
            EngineMessageRole::Assistant => MessageRole::Assistant,
            EngineMessageRole::Tool => MessageRole::Tool,
        }
    }
}

impl From<EngineToolCallSummary> for ToolCallSummary {
    fn from(tc: EngineToolCallSummary) -> Self {
        ToolCallSummary { call_id: tc.call_id, tool_name: tc.tool_name, output: tc.output, is_error: tc.is_error }
    }
}

impl From<CoalescedMessage> for ClientMessage {
    fn from(msg: CoalescedMessage) -> Self {
        ClientMessage {
            role: msg.role.into(),
            text: msg.text,
            reasoning: msg.reasoning,
            tool_calls: msg.tool_calls.into_iter().map(Into::into).collect(),
            message_id: Some(msg.message_id),
            sender_id: msg.sender_id,
            timestamp: msg.timestamp,
        }
    }
}

/// Translate one `StreamTriple` pushed by the engine's fan-out into zero or
/// more store actions: a finalized triple yields `AddMessage` (and clears the
/// streaming slot); a raw delta yields `StreamChunk` stamped with the id the
/// in-progress message will be finalized under (`pending_message_id`); a
/// tool-approval request yields `ApprovalRequested`.
pub fn triple_to_actions(topic_id: TopicId, triple: StreamTriple) -> Vec<Action> {
    let mut actions = Vec::new();

    if let Some(coalesced) = triple.coalesced {
        actions.push(Action::AddMessage { topic_id: topic_id.clone(), message: coalesced.into() });
        return actions;
    }

    let message_id = triple.pending_message_id;
    for content in triple.update.contents {
        match content {
            UpdateContent::TextDelta(text) => actions.push(Action::StreamChunk {
                topic_id: topic_id.clone(),
                text_delta: Some(text),
                reasoning_delta: None,
                tool_call: None,
                message_id: message_id.clone(),
            }),
            UpdateContent::ReasoningDelta(text) => actions.push(Action::StreamChunk {
                topic_id: topic_id.clone(),
                text_delta: None,
                reasoning_delta: Some(text),
                tool_call: None,
                message_id: message_id.clone(),
            }),
            UpdateContent::ToolCallStart { call_id, tool_name } => actions.push(Action::StreamChunk {
                topic_id: topic_id.clone(),
                text_delta: None,
                reasoning_delta: None,
                tool_call: Some(ToolCallSummary { call_id, tool_name, output: None, is_error: false }),
                message_id: message_id.clone(),
            }),
            UpdateContent::ToolCallArg { .. } => {}
            UpdateContent::ToolResult { call_id, tool_name, output, is_error } => actions.push(Action::StreamChunk {
                topic_id: topic_id.clone(),
                text_delta: None,
                reasoning_delta: None,
                tool_call: Some(ToolCallSummary { call_id, tool_name, output: Some(output), is_error }),
                message_id: message_id.clone(),
            }),
            UpdateContent::ToolApprovalRequested { call_id, tool_name, args } => actions.push(Action::ApprovalRequested {
                call_id: call_id.clone(),
                topic_id: topic_id.clone(),
                tool_calls: vec![ToolCallSummary { call_id, tool_name, output: Some(args.to_string()), is_error: false }],
            }),
            UpdateContent::StreamComplete => actions.push(Action::ResetStreamingContent(topic_id.clone())),
            UpdateContent::Error(err) => actions.push(Action::SetError(Some(err))),
        }
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sven_engine::{ModelUpdate, ThreadKey};

    fn key() -> ThreadKey {
        ThreadKey::new("tg", 1, 1, "A")
    }

    #[test]
    fn finalized_triple_becomes_add_message() {
        let triple = StreamTriple {
            key: key(),
            update: ModelUpdate::stream_complete(1),
            coalesced: Some(CoalescedMessage {
                role: EngineMessageRole::Assistant,
                text: "hi".into(),
                reasoning: String::new(),
                tool_calls: vec![],
                message_id: "m1".into(),
                sender_id: "bot".into(),
                timestamp: Utc::now(),
            }),
            pending_message_id: Some("m1".into()),
        };
        let actions = triple_to_actions("t1".into(), triple);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], Action::AddMessage { .. }));
    }

    #[test]
    fn delta_triple_becomes_stream_chunk() {
        let triple = StreamTriple {
            key: key(),
            update: ModelUpdate::new(1, UpdateContent::TextDelta("hey".into())),
            coalesced: None,
            pending_message_id: Some("pending-1".into()),
        };
        let actions = triple_to_actions("t1".into(), triple);
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], Action::StreamChunk { message_id, .. } if message_id.as_deref() == Some("pending-1")));
    }
}
