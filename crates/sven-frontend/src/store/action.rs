// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Action vocabulary dispatched against the store (spec §4.10).

use crate::store::state::{ClientMessage, ConnectionStatus, Topic, ToolCallSummary, TopicId};

#[derive(Debug, Clone)]
pub enum Action {
    /// A brand new topic became known (provisioned locally or pushed by the server).
    AddTopic(Topic),
    UpdateTopic(Topic),
    RemoveTopic(TopicId),
    SelectTopic(TopicId),
    /// User asked for a new conversation; `id` is a client-generated placeholder
    /// until the server's provisioned topic id arrives via `AddTopic`.
    CreateNewTopic { id: TopicId, name: String },

    /// A finalized message to append (from a live turn boundary or a resume batch).
    AddMessage { topic_id: TopicId, message: ClientMessage },
    /// Rewrite of a previously appended message, matched by `message_id`.
    UpdateMessage { topic_id: TopicId, message: ClientMessage },
    /// Bulk replace of a topic's history, e.g. initial load from persistence.
    MessagesLoaded { topic_id: TopicId, messages: Vec<ClientMessage> },

    /// A raw streaming delta arrived; folds into the topic's `StreamingSlot`.
    /// `message_id` is the id the in-progress message will be finalized
    /// under once its turn boundary is reached (spec §4.10: `StreamChunk(
    /// topicId, text?, reasoning?, toolCalls?, messageId?)`); it starts a
    /// fresh slot when it differs from the slot's current id, and the chunk
    /// is dropped outright when that id is already finalized.
    StreamChunk {
        topic_id: TopicId,
        text_delta: Option<String>,
        reasoning_delta: Option<String>,
        tool_call: Option<ToolCallSummary>,
        message_id: Option<String>,
    },
    /// The in-progress slot for a topic should be dropped (turn boundary reached
    /// and finalized via `AddMessage`, or the thread was cancelled/cleared).
    ResetStreamingContent(TopicId),

    Connecting,
    Connected,
    Reconnecting,
    Reconnected,
    Closed,

    ApprovalRequested { call_id: String, topic_id: TopicId, tool_calls: Vec<ToolCallSummary> },
    ApprovalResolved { call_id: String },

    SetError(Option<String>),
}

impl From<ConnectionStatus> for Action {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Disconnected => Action::Closed,
            ConnectionStatus::Connecting => Action::Connecting,
            ConnectionStatus::Connected => Action::Connected,
            ConnectionStatus::Reconnecting => Action::Reconnecting,
            ConnectionStatus::Closed => Action::Closed,
        }
    }
}
