// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Effects: cooperative tasks that react to store transitions without
//! dispatching synchronously from inside the reducer path (spec §5: effects
//! are cooperative tasks dispatched off the render loop).

use std::rc::Rc;

use tokio::sync::mpsc;

use crate::store::pipeline::resume_from_buffer;
use crate::store::{Action, ClientMessage, Store, TopicId};

/// A resume batch as delivered by the transport once a `Reconnecting ->
/// Connected` transition completes (spec §4.9/§4.11).
#[derive(Debug, Clone)]
pub struct ResumeBatch {
    pub topic_id: TopicId,
    pub finalized: Vec<ClientMessage>,
}

/// Registers the reconnection effect: on `Action::Reconnected`, requests a
/// resume batch over `request_resume` and merges it into history via
/// [`resume_from_buffer`], dispatching the merged result as
/// `Action::MessagesLoaded`.
///
/// `request_resume` is expected to be cheap to call (e.g. send onto a
/// channel the transport task drains); the actual network round trip happens
/// off this callback, in the task that owns `batches_rx`.
pub fn install_reconnection_effect(store: &Rc<Store>, request_resume: mpsc::UnboundedSender<TopicId>) {
    store.subscribe(move |state, action| {
        if matches!(action, Action::Reconnected) {
            if let Some(topic_id) = state.selected_topic.clone() {
                let _ = request_resume.send(topic_id);
            }
        }
    });
}

/// Drains `batches_rx` (fed by the transport task after each resume round
/// trip) and applies each batch to the store.
pub async fn run_resume_merge_loop(store: Rc<Store>, mut batches_rx: mpsc::UnboundedReceiver<ResumeBatch>) {
    while let Some(batch) = batches_rx.recv().await {
        let merged = {
            let state = store.state();
            let history = state.messages(&batch.topic_id);
            resume_from_buffer(history, &batch.finalized)
        };
        let _ = store.dispatch(Action::MessagesLoaded { topic_id: batch.topic_id, messages: merged });
    }
}

/// Outbound prompt submission: validates `state.input_enabled()` before
/// forwarding `text` to the transport, matching the `ConnectionStatus`
/// gating in spec §4.11 ("Input is disabled in any state != Connected").
pub fn send_message(store: &Store, outbound: &mpsc::UnboundedSender<(TopicId, String)>, topic_id: TopicId, text: String) -> bool {
    if !store.state().input_enabled() {
        return false;
    }
    outbound.send((topic_id, text)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::state::{MessageRole, Topic};
    use chrono::Utc;

    fn msg(id: &str) -> ClientMessage {
        ClientMessage {
            role: MessageRole::Assistant,
            text: "hi".into(),
            reasoning: String::new(),
            tool_calls: vec![],
            message_id: Some(id.into()),
            sender_id: "bot".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn send_message_blocked_when_disconnected() {
        let store = Store::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sent = send_message(&store, &tx, "t1".into(), "hello".into());
        assert!(!sent);
    }

    #[test]
    fn send_message_allowed_when_connected() {
        let store = Store::new();
        store.dispatch(Action::Connected).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sent = send_message(&store, &tx, "t1".into(), "hello".into());
        assert!(sent);
        assert_eq!(rx.try_recv().unwrap(), ("t1".to_string(), "hello".to_string()));
    }

    #[tokio::test]
    async fn resume_merge_loop_applies_batches() {
        let store = Store::new();
        store.dispatch(Action::AddTopic(Topic { id: "t1".into(), name: "General".into() })).unwrap();
        store.dispatch(Action::AddMessage { topic_id: "t1".into(), message: msg("m1") }).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ResumeBatch { topic_id: "t1".into(), finalized: vec![msg("m1"), msg("m2")] }).unwrap();
        drop(tx);

        run_resume_merge_loop(store.clone(), rx).await;
        assert_eq!(store.state().messages("t1").len(), 2);
    }
}
