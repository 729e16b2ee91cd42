// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Store state slices (spec §4.10): `Topics`, `MessagesByTopic`,
//! `StreamingByTopic`, `ConnectionStatus`, `PendingApprovals`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TopicId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallSummary {
    pub call_id: String,
    pub tool_name: String,
    pub output: Option<String>,
    pub is_error: bool,
}

/// The client's view of one finalized or in-progress message (spec §3
/// `ClientMessage`). `message_id`, when present, is the de-dup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub role: MessageRole,
    pub text: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCallSummary>,
    pub message_id: Option<String>,
    pub sender_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: TopicId,
    pub name: String,
}

/// Scratch space for an in-progress turn: accumulated text/reasoning/tool
/// calls not yet finalized into a `ClientMessage` (spec §3 mirrors
/// `StreamTriple` on the client side of the wire).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamingSlot {
    pub message_id: Option<String>,
    pub text: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCallSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub topic_id: TopicId,
    pub tool_calls: Vec<ToolCallSummary>,
}

/// The entire client-side store (spec §4.10). Mutated only by [`super::reducer::reduce`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    pub topics: HashMap<TopicId, Topic>,
    pub selected_topic: Option<TopicId>,
    pub messages_by_topic: HashMap<TopicId, Vec<ClientMessage>>,
    pub streaming_by_topic: HashMap<TopicId, StreamingSlot>,
    /// Finalized message ids already applied per topic — the only defense
    /// against double-application of a chunk/message arriving both via the
    /// live stream and via a resume buffer (DESIGN NOTES: message-pipeline
    /// dedup).
    pub finalized_ids: HashMap<TopicId, HashSet<String>>,
    pub connection_status: ConnectionStatus,
    pub last_error: Option<String>,
    pub pending_approvals: HashMap<String, PendingApproval>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        ConnectionStatus::Disconnected
    }
}

impl StoreState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, topic: &str) -> &[ClientMessage] {
        self.messages_by_topic.get(topic).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn streaming(&self, topic: &str) -> Option<&StreamingSlot> {
        self.streaming_by_topic.get(topic)
    }

    /// Input is disabled in any connection state other than `Connected`
    /// (spec §4.11 client state machine).
    pub fn input_enabled(&self) -> bool {
        self.connection_status == ConnectionStatus::Connected
    }
}
