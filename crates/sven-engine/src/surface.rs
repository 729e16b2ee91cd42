// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The surface contract (spec §6): every chat front-end — long-polled bot
//! API, push channel, or terminal — implements this to supply prompts and
//! consume triples. Expressed as one capability bundle rather than dynamic
//! dispatch over per-transport adapter types (DESIGN NOTES: "dynamic
//! dispatch via multiple messenger adapters" -> "a capability bundle").

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::types::{StreamTriple, ThreadKey};

#[async_trait]
pub trait Surface: Send + Sync {
    fn id(&self) -> &str;

    /// Whether this surface can provision threads for scheduled runs with no
    /// user present (spec §6 "capability flag"). Default: no.
    fn supports_scheduled_notifications(&self) -> bool {
        false
    }

    /// Materialize a new thread on this surface, returning its id.
    async fn provision_thread(&self, conversation_id: i64, name: &str, cancel: &CancellationToken) -> anyhow::Result<i64>;

    /// Probe whether a thread still exists on the origin surface (used by
    /// `ThreadRegistry::sweep`).
    async fn thread_exists(&self, conversation_id: i64, thread_id: i64, cancel: &CancellationToken) -> bool;

    /// Surface may open a server-side typing indicator.
    async fn begin_turn(&self, key: &ThreadKey);

    /// Surface-specific rendering of deltas and coalesced messages. Push
    /// surfaces additionally append the triple to `ReconnectionBuffer`
    /// (handled one layer up, by `ResponseFanOut`, not here).
    async fn emit(&self, triple: &StreamTriple);

    /// Called on observing a `StreamComplete`.
    async fn end_turn(&self, key: &ThreadKey);

    /// Composition of `provision_thread` for prompts that already carry a
    /// resolved thread id, or a fresh provision otherwise.
    async fn create_topic_if_needed(
        &self,
        conversation_id: i64,
        thread_id: Option<i64>,
        agent_id: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ThreadKey> {
        let resolved = match thread_id {
            Some(t) => t,
            None => self.provision_thread(conversation_id, name, cancel).await?,
        };
        Ok(ThreadKey::new(self.id(), conversation_id, resolved, agent_id))
    }
}

/// Looks surfaces up by id for `ResponseFanOut` dispatch and for the
/// provisioner/sweep paths.
#[derive(Default, Clone)]
pub struct SurfaceRegistry {
    surfaces: HashMap<String, Arc<dyn Surface>>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, surface: Arc<dyn Surface>) {
        self.surfaces.insert(surface.id().to_string(), surface);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Surface>> {
        self.surfaces.get(id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Surface>> {
        self.surfaces.values()
    }
}
