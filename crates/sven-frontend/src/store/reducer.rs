// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Pure reducer over [`StoreState`] (spec §4.10, §8 property 8: reducers are
//! pure functions of `(state, action)` with no side effects).

use crate::store::action::Action;
use crate::store::state::{StoreState, StreamingSlot};

/// Apply `action` to `state` in place. Never performs I/O, never blocks, and
/// never touches anything outside `state` — effects that need to talk to the
/// transport live in [`super::effects`], subscribed to the transitions this
/// produces.
pub fn reduce(state: &mut StoreState, action: Action) {
    match action {
        Action::AddTopic(topic) => {
            state.topics.insert(topic.id.clone(), topic);
        }
        Action::UpdateTopic(topic) => {
            state.topics.insert(topic.id.clone(), topic);
        }
        Action::RemoveTopic(id) => {
            state.topics.remove(&id);
            state.messages_by_topic.remove(&id);
            state.streaming_by_topic.remove(&id);
            state.finalized_ids.remove(&id);
            if state.selected_topic.as_deref() == Some(id.as_str()) {
                state.selected_topic = None;
            }
        }
        Action::SelectTopic(id) => {
            state.selected_topic = Some(id);
        }
        Action::CreateNewTopic { id, name } => {
            state.topics.insert(id.clone(), crate::store::state::Topic { id: id.clone(), name });
            state.selected_topic = Some(id);
        }

        Action::AddMessage { topic_id, message } => {
            if let Some(id) = &message.message_id {
                let seen = state.finalized_ids.entry(topic_id.clone()).or_default();
                if !seen.insert(id.clone()) {
                    // Already applied (e.g. arrived once live, once via resume). Drop silently.
                    return;
                }
            }
            state.messages_by_topic.entry(topic_id.clone()).or_default().push(message);
            state.streaming_by_topic.remove(&topic_id);
        }
        Action::UpdateMessage { topic_id, message } => {
            if let Some(list) = state.messages_by_topic.get_mut(&topic_id) {
                if let Some(existing) = list.iter_mut().find(|m| m.message_id == message.message_id) {
                    *existing = message;
                }
            }
        }
        Action::MessagesLoaded { topic_id, messages } => {
            let seen = state.finalized_ids.entry(topic_id.clone()).or_default();
            seen.clear();
            seen.extend(messages.iter().filter_map(|m| m.message_id.clone()));
            state.messages_by_topic.insert(topic_id, messages);
        }

        Action::StreamChunk { topic_id, text_delta, reasoning_delta, tool_call, message_id } => {
            // The only defense against double-application of a chunk that
            // arrives both via the live stream and via a resume buffer: a
            // chunk for an already-finalized message is a no-op.
            if let Some(id) = message_id.as_deref() {
                if state.finalized_ids.get(&topic_id).is_some_and(|ids| ids.contains(id)) {
                    return;
                }
            }

            let slot = state.streaming_by_topic.entry(topic_id).or_insert_with(StreamingSlot::default);
            if message_id.is_some() && slot.message_id.is_some() && slot.message_id != message_id {
                // A different message id than the slot's current one: start fresh.
                *slot = StreamingSlot { message_id: message_id.clone(), ..StreamingSlot::default() };
            } else if slot.message_id.is_none() {
                slot.message_id = message_id.clone();
            }
            if let Some(t) = text_delta {
                slot.text.push_str(&t);
            }
            if let Some(r) = reasoning_delta {
                slot.reasoning.push_str(&r);
            }
            if let Some(tc) = tool_call {
                match slot.tool_calls.iter_mut().find(|existing| existing.call_id == tc.call_id) {
                    Some(existing) => *existing = tc,
                    None => slot.tool_calls.push(tc),
                }
            }
        }
        Action::ResetStreamingContent(topic_id) => {
            state.streaming_by_topic.remove(&topic_id);
        }

        Action::Connecting => state.connection_status = crate::store::state::ConnectionStatus::Connecting,
        Action::Connected => {
            state.connection_status = crate::store::state::ConnectionStatus::Connected;
            state.last_error = None;
        }
        Action::Reconnecting => state.connection_status = crate::store::state::ConnectionStatus::Reconnecting,
        Action::Reconnected => {
            state.connection_status = crate::store::state::ConnectionStatus::Connected;
            state.last_error = None;
        }
        Action::Closed => state.connection_status = crate::store::state::ConnectionStatus::Closed,

        Action::ApprovalRequested { call_id, topic_id, tool_calls } => {
            state.pending_approvals.insert(call_id, crate::store::state::PendingApproval { topic_id, tool_calls });
        }
        Action::ApprovalResolved { call_id } => {
            state.pending_approvals.remove(&call_id);
        }

        Action::SetError(err) => state.last_error = err,
    }
}
