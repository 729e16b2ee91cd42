// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `ApprovalStore` — instance-owned state for suspended tool calls awaiting
//! operator approval (DESIGN NOTES: "global static dictionary of pending
//! approvals" -> "a dedicated `ApprovalStore` component scoped to the engine
//! process; keys are `(threadKey, approvalId)`").

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::oneshot;

use sven_core::ApprovalWaiter;

use crate::types::ThreadKey;

#[derive(Default)]
pub struct ApprovalStore {
    pending: Mutex<HashMap<(ThreadKey, String), oneshot::Sender<bool>>>,
}

impl ApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend until the operator decides, or the waiter is dropped without
    /// a decision (e.g. the thread is cleared mid-approval), in which case
    /// this resolves to `false` (deny) rather than hanging forever.
    pub async fn wait(&self, key: &ThreadKey, call_id: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert((key.clone(), call_id.to_string()), tx);
        rx.await.unwrap_or(false)
    }

    /// Resolve a pending approval. Returns `true` if a matching waiter was
    /// found (and thus actually resolved), `false` otherwise.
    pub fn resolve(&self, key: &ThreadKey, call_id: &str, approved: bool) -> bool {
        if let Some(tx) = self.pending.lock().unwrap().remove(&(key.clone(), call_id.to_string())) {
            let _ = tx.send(approved);
            true
        } else {
            false
        }
    }

    /// Deny and drop every pending approval for a thread — called when the
    /// thread is cleared so no waiter is left dangling.
    pub fn cancel_thread(&self, key: &ThreadKey) {
        let mut pending = self.pending.lock().unwrap();
        let ids: Vec<(ThreadKey, String)> = pending.keys().filter(|(k, _)| k == key).cloned().collect();
        for id in ids {
            if let Some(tx) = pending.remove(&id) {
                let _ = tx.send(false);
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

/// Adapts `ApprovalStore` to `sven_core`'s per-agent `ApprovalWaiter` trait,
/// scoping it to one `ThreadKey` for the lifetime of a single agent run.
pub struct ThreadApprovalWaiter {
    pub store: std::sync::Arc<ApprovalStore>,
    pub key: ThreadKey,
}

#[async_trait]
impl ApprovalWaiter for ThreadApprovalWaiter {
    async fn wait_for_decision(&self, call_id: &str) -> bool {
        self.store.wait(&self.key, call_id).await
    }
}
