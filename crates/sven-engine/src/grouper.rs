// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `StreamingGrouper` (spec §4.3) — the heart of the engine's concurrency
//! discipline. Takes the merged prompt sequence from all surfaces and groups
//! it by `ThreadKey`, opening a fresh downstream sub-sequence for each new
//! key and preserving per-thread prompt order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{Prompt, ThreadKey};

type OpenGroups = Arc<Mutex<HashMap<ThreadKey, mpsc::Sender<Prompt>>>>;

/// One per-key sub-sequence, handed to `AgentRunner`.
pub struct Group {
    pub key: ThreadKey,
    pub prompts: mpsc::Receiver<Prompt>,
    open: OpenGroups,
}

impl Group {
    /// Explicitly closes this sub-sequence: the grouper forgets the key, so
    /// a later prompt for the same key opens a brand new group rather than
    /// being routed here (spec §4.3: "open ... until the owning consumer
    /// explicitly calls its `complete()` hook"). Dropping the grouper's
    /// sender side also ends this group's `prompts` receiver.
    pub fn complete(&self) {
        self.open.lock().unwrap().remove(&self.key);
    }

    /// A cloneable handle that only exposes `complete()`, for registering as
    /// a `ThreadContext` on-clear callback (spec §4.4 step 2).
    pub fn completion_handle(&self) -> GroupCompletionHandle {
        GroupCompletionHandle { key: self.key.clone(), open: self.open.clone() }
    }
}

#[derive(Clone)]
pub struct GroupCompletionHandle {
    key: ThreadKey,
    open: OpenGroups,
}

impl GroupCompletionHandle {
    pub fn complete(&self) {
        self.open.lock().unwrap().remove(&self.key);
    }
}

pub struct StreamingGrouper {
    open: OpenGroups,
}

impl Default for StreamingGrouper {
    fn default() -> Self {
        Self { open: Arc::new(Mutex::new(HashMap::new())) }
    }
}

impl StreamingGrouper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes `inbound`, computing `key_fn(prompt)` for each item, and
    /// emits a `Group` on `groups_tx` the first time a key is seen. Multiple
    /// groups are drained concurrently downstream; this loop itself performs
    /// no cross-group serialization beyond the single merged inbound queue.
    pub async fn run<F>(self: Arc<Self>, mut inbound: mpsc::Receiver<Prompt>, groups_tx: mpsc::Sender<Group>, key_fn: F, cancel: CancellationToken)
    where
        F: Fn(&Prompt) -> ThreadKey,
    {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Cancellation of the outer source propagates to all
                    // sub-sequences: dropping every sender closes each
                    // group's receiver.
                    self.open.lock().unwrap().clear();
                    break;
                }
                maybe_prompt = inbound.recv() => {
                    let Some(prompt) = maybe_prompt else {
                        // Outer source completed; currently-buffered items in
                        // each sub-sequence still drain normally since we only
                        // drop our sender handles, not the receivers' buffers.
                        self.open.lock().unwrap().clear();
                        break;
                    };
                    let key = key_fn(&prompt);
                    let sender = {
                        let mut open = self.open.lock().unwrap();
                        open.get(&key).cloned()
                    };
                    let sender = match sender {
                        Some(tx) => tx,
                        None => {
                            let (tx, rx) = mpsc::channel(64);
                            self.open.lock().unwrap().insert(key.clone(), tx.clone());
                            let group = Group { key: key.clone(), prompts: rx, open: self.open.clone() };
                            debug!(%key, "new thread group opened");
                            if groups_tx.send(group).await.is_err() {
                                // No one left to consume groups; nothing more to do.
                                return;
                            }
                            tx
                        }
                    };
                    // Backpressure here is intentional (spec §5): a slow
                    // consumer for one key delays routing to all keys behind
                    // it in the single merged inbound queue.
                    let _ = sender.send(prompt).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn prompt(conv: i64, body: &str) -> Prompt {
        Prompt {
            surface_id: "test".into(),
            conversation_id: conv,
            thread_id: Some(conv),
            agent_id: "a".into(),
            sender_id: "s".into(),
            body: body.into(),
            timestamp: Utc::now(),
            reply_target: None,
            message_id: format!("{conv}-{body}"),
            thread_name_hint: None,
        }
    }

    fn key_fn(p: &Prompt) -> ThreadKey {
        ThreadKey::new(p.surface_id.clone(), p.conversation_id, p.thread_id.unwrap(), p.agent_id.clone())
    }

    #[tokio::test]
    async fn new_key_emits_exactly_one_group() {
        let grouper = Arc::new(StreamingGrouper::new());
        let (in_tx, in_rx) = mpsc::channel(16);
        let (groups_tx, mut groups_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        in_tx.send(prompt(1, "a")).await.unwrap();
        in_tx.send(prompt(1, "b")).await.unwrap();
        drop(in_tx);

        grouper.run(in_rx, groups_tx, key_fn, cancel).await;

        let mut group = groups_rx.recv().await.expect("one group");
        assert!(groups_rx.try_recv().is_err(), "only one group for one key");

        let first = group.prompts.recv().await.unwrap();
        let second = group.prompts.recv().await.unwrap();
        assert_eq!(first.body, "a");
        assert_eq!(second.body, "b");
    }

    #[tokio::test]
    async fn distinct_keys_emit_distinct_groups() {
        let grouper = Arc::new(StreamingGrouper::new());
        let (in_tx, in_rx) = mpsc::channel(16);
        let (groups_tx, mut groups_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        in_tx.send(prompt(1, "a")).await.unwrap();
        in_tx.send(prompt(2, "b")).await.unwrap();
        drop(in_tx);

        grouper.run(in_rx, groups_tx, key_fn, cancel).await;

        let g1 = groups_rx.recv().await.unwrap();
        let g2 = groups_rx.recv().await.unwrap();
        assert_ne!(g1.key, g2.key);
    }

    #[tokio::test]
    async fn prompt_order_within_a_thread_is_preserved() {
        let grouper = Arc::new(StreamingGrouper::new());
        let (in_tx, in_rx) = mpsc::channel(16);
        let (groups_tx, mut groups_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        for i in 0..10 {
            in_tx.send(prompt(1, &i.to_string())).await.unwrap();
        }
        drop(in_tx);

        grouper.run(in_rx, groups_tx, key_fn, cancel).await;
        let mut group = groups_rx.recv().await.unwrap();
        for i in 0..10 {
            let p = group.prompts.recv().await.unwrap();
            assert_eq!(p.body, i.to_string());
        }
    }

    #[tokio::test]
    async fn complete_forgets_key_so_a_later_prompt_opens_a_new_group() {
        let grouper = Arc::new(StreamingGrouper::new());
        let (in_tx, in_rx) = mpsc::channel(16);
        let (groups_tx, mut groups_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let grouper2 = grouper.clone();
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move { grouper2.run(in_rx, groups_tx, key_fn, cancel2).await });

        in_tx.send(prompt(1, "a")).await.unwrap();
        let group = groups_rx.recv().await.unwrap();
        group.complete();

        in_tx.send(prompt(1, "b")).await.unwrap();
        let group2 = groups_rx.recv().await.unwrap();
        assert_eq!(group2.key, group.key);

        drop(in_tx);
        cancel.cancel();
        let _ = tokio::time::timeout(std::time::Duration::from_millis(200), handle).await;
    }
}
