// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Core data model shared across the engine's components (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Identity of a live conversation thread.
///
/// `surface_id` is carried even though the source only lists conversation id,
/// thread id and agent id: conversation ids are surface-scoped (a Telegram
/// chat id and a Discord channel id can collide numerically), so the surface
/// is folded into equality/hash rather than assumed out-of-band.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadKey {
    pub surface_id: String,
    pub conversation_id: i64,
    pub thread_id: i64,
    pub agent_id: String,
}

impl ThreadKey {
    pub fn new(surface_id: impl Into<String>, conversation_id: i64, thread_id: i64, agent_id: impl Into<String>) -> Self {
        Self {
            surface_id: surface_id.into(),
            conversation_id,
            thread_id,
            agent_id: agent_id.into(),
        }
    }
}

impl std::fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}/{}", self.surface_id, self.conversation_id, self.thread_id, self.agent_id)
    }
}

/// An inbound message from a chat surface, possibly pre-provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub surface_id: String,
    pub conversation_id: i64,
    /// Absent until `TopicProvisioner` assigns one.
    pub thread_id: Option<i64>,
    pub agent_id: String,
    pub sender_id: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub reply_target: Option<String>,
    /// Surface-native message id; used as the idempotency key for provisioning.
    pub message_id: String,
    /// Overrides `TopicProvisioner`'s default "first 32 glyphs of body" thread
    /// name (spec §4.2) when a caller already knows the right name — e.g. the
    /// scheduler's "Scheduled task" threads (spec §6).
    #[serde(default)]
    pub thread_name_hint: Option<String>,
}

impl Prompt {
    /// `ThreadKey` for this prompt once `thread_id` is known.
    pub fn thread_key(&self) -> Option<ThreadKey> {
        self.thread_id.map(|t| ThreadKey::new(self.surface_id.clone(), self.conversation_id, t, self.agent_id.clone()))
    }
}

/// Derived purely from the leading token of `Prompt.body` (spec §8 property 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Cancel,
    Clear,
    None,
}

impl ControlCommand {
    pub fn parse(body: &str) -> Self {
        let lead = body.trim().split_whitespace().next().unwrap_or("");
        match lead.to_ascii_lowercase().as_str() {
            "/cancel" => ControlCommand::Cancel,
            "/clear" => ControlCommand::Clear,
            _ => ControlCommand::None,
        }
    }
}

/// One piece of content inside a `ModelUpdate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UpdateContent {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCallStart { call_id: String, tool_name: String },
    ToolCallArg { call_id: String, fragment: String },
    ToolResult { call_id: String, tool_name: String, output: String, is_error: bool },
    ToolApprovalRequested { call_id: String, tool_name: String, args: serde_json::Value },
    StreamComplete,
    Error(String),
}

/// A raw delta streamed from the model abstraction. `id` advances
/// monotonically for all updates belonging to a single response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub id: u64,
    pub contents: Vec<UpdateContent>,
}

impl ModelUpdate {
    pub fn new(id: u64, content: UpdateContent) -> Self {
        Self { id, contents: vec![content] }
    }

    pub fn stream_complete(id: u64) -> Self {
        Self::new(id, UpdateContent::StreamComplete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallSummary {
    pub call_id: String,
    pub tool_name: String,
    pub args: serde_json::Value,
    pub output: Option<String>,
    pub is_error: bool,
}

/// The aggregated content accumulated between two turn boundaries — the unit
/// of persistence and client display (GLOSSARY).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalescedMessage {
    pub role: MessageRole,
    pub text: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCallSummary>,
    /// Stable within a run; derived from `hash(ThreadKey, boundary sequence number)`
    /// when no natural id (e.g. provider message id) is available.
    pub message_id: String,
    pub sender_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Deterministic message id for a turn boundary, per spec §4.5.
pub fn boundary_message_id(key: &ThreadKey, boundary_seq: u64) -> String {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    boundary_seq.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// `(ThreadKey, ModelUpdate, CoalescedMessage?)` — the engine's output quantum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamTriple {
    pub key: ThreadKey,
    pub update: ModelUpdate,
    pub coalesced: Option<CoalescedMessage>,
    /// The `message_id` the current accumulation will be (or was) finalized
    /// under — the same id `coalesced.message_id` carries once a boundary is
    /// reached. Lets a raw, pre-boundary delta be attributed to the message
    /// it belongs to (spec §4.10 `StreamChunk(..., messageId?)`).
    pub pending_message_id: Option<String>,
}

impl StreamTriple {
    /// A turn just closed on this triple's thread.
    pub fn is_turn_boundary(&self) -> bool {
        self.coalesced.is_some()
    }

    pub fn is_stream_complete(&self) -> bool {
        self.update.contents.iter().any(|c| matches!(c, UpdateContent::StreamComplete))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_command_parsing_is_case_insensitive_and_leading_token_only() {
        assert_eq!(ControlCommand::parse("/cancel"), ControlCommand::Cancel);
        assert_eq!(ControlCommand::parse("/CANCEL please"), ControlCommand::Cancel);
        assert_eq!(ControlCommand::parse("/clear"), ControlCommand::Clear);
        assert_eq!(ControlCommand::parse("  /Clear now"), ControlCommand::Clear);
        assert_eq!(ControlCommand::parse("hello /cancel"), ControlCommand::None);
        assert_eq!(ControlCommand::parse(""), ControlCommand::None);
        assert_eq!(ControlCommand::parse("cancel"), ControlCommand::None);
    }

    #[test]
    fn boundary_message_id_is_stable_for_same_inputs() {
        let key = ThreadKey::new("tg", 1, 2, "a");
        assert_eq!(boundary_message_id(&key, 3), boundary_message_id(&key, 3));
    }

    #[test]
    fn boundary_message_id_differs_across_sequence_numbers() {
        let key = ThreadKey::new("tg", 1, 2, "a");
        assert_ne!(boundary_message_id(&key, 1), boundary_message_id(&key, 2));
    }

    #[test]
    fn thread_key_equality_is_surface_scoped() {
        let a = ThreadKey::new("telegram", 1, 1, "agent");
        let b = ThreadKey::new("discord", 1, 1, "agent");
        assert_ne!(a, b);
    }
}
