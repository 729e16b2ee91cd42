// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Engine startup — assembles every subsystem and wires the data flow
//! described in spec §2:
//!
//! ```text
//! surfaces ─(PromptSource)─► ingress ─► provisioning ─► StreamingGrouper
//!                                                            │
//!                                                    per-key Groups
//!                                                            ▼
//!                                                       AgentRunner
//!                                                            │
//!                                              per-key ModelUpdate streams
//!                                                            ▼
//!                                                     ResponseFanOut ──► surfaces
//!                                                            │
//!                                                            ▼
//!                                                   ReconnectionBuffer
//! ```
//!
//! [`Engine::start`] performs, in order:
//! 1. Merge every registered surface's `PromptSource` into one inbound queue.
//! 2. Resolve each prompt's thread via `TopicProvisioner` (provisioning new
//!    threads on their origin surface as needed).
//! 3. Group provisioned prompts by `ThreadKey` via `StreamingGrouper`.
//! 4. Spawn `AgentRunner::run_group` per newly opened group.
//! 5. Run `ResponseFanOut`'s fair per-key merge back out to surfaces.
//! 6. Spawn a periodic sweep that retires threads whose surface reports gone.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use sven_config::Config;
use sven_model::ModelProvider;

use crate::approvals::ApprovalStore;
use crate::buffer::{ReconnectionBuffer, ResumePayload};
use crate::fanout::{FanOutHandle, ResponseFanOut};
use crate::grouper::StreamingGrouper;
use crate::prompt::{run_ingress, PromptSource};
use crate::provisioner::TopicProvisioner;
use crate::registry::{InMemorySnapshotStore, SnapshotStore, ThreadRegistry};
use crate::runner::{run_group, AgentFactory, SvenAgentFactory};
use crate::surface::{Surface, SurfaceRegistry};
use crate::types::{Prompt, ThreadKey};

/// Default interval between `ThreadRegistry::sweep` / `ReconnectionBuffer`
/// eviction passes.
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Builder for the running engine: register surfaces and prompt sources,
/// then call `start`.
pub struct Engine {
    config: Arc<Config>,
    surfaces: SurfaceRegistry,
    sources: Vec<Arc<dyn PromptSource>>,
    snapshot_store: Arc<dyn SnapshotStore>,
    factory: Option<Arc<dyn AgentFactory>>,
    approvals: Arc<ApprovalStore>,
    sweep_interval: Duration,
}

impl Engine {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            surfaces: SurfaceRegistry::new(),
            sources: Vec::new(),
            snapshot_store: Arc::new(InMemorySnapshotStore::default()),
            factory: None,
            approvals: Arc::new(ApprovalStore::new()),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }

    pub fn register_surface(&mut self, surface: Arc<dyn Surface>) -> &mut Self {
        self.surfaces.register(surface);
        self
    }

    pub fn register_source(&mut self, source: Arc<dyn PromptSource>) -> &mut Self {
        self.sources.push(source);
        self
    }

    pub fn with_snapshot_store(&mut self, store: Arc<dyn SnapshotStore>) -> &mut Self {
        self.snapshot_store = store;
        self
    }

    pub fn with_sweep_interval(&mut self, interval: Duration) -> &mut Self {
        self.sweep_interval = interval;
        self
    }

    /// Use a custom `AgentFactory` instead of the default `SvenAgentFactory`
    /// built from `model`. Useful for tests, or hosts that want a factory
    /// producing agents with bespoke tool sets.
    pub fn with_agent_factory(&mut self, factory: Arc<dyn AgentFactory>) -> &mut Self {
        self.factory = Some(factory);
        self
    }

    /// Assemble the default `SvenAgentFactory` from a model provider, gated
    /// through this engine's own `ApprovalStore`. Either this or
    /// `with_agent_factory` must be called before `start`.
    pub fn with_model(&mut self, model: Arc<dyn ModelProvider>) -> &mut Self {
        self.factory = Some(Arc::new(SvenAgentFactory::new(self.config.clone(), model, self.approvals.clone())));
        self
    }

    /// Spawn every subsystem and return a handle for shutdown, resume, and
    /// approval resolution. Panics if no `AgentFactory` was configured via
    /// `with_model` or `with_agent_factory` — a programming error, not a
    /// runtime condition.
    pub fn start(self) -> EngineHandle {
        let factory = self.factory.expect("Engine::start called with no agent factory configured");
        let surfaces = Arc::new(self.surfaces);
        let registry = Arc::new(ThreadRegistry::new(self.snapshot_store));
        let buffer = Arc::new(ReconnectionBuffer::with_capacity(
            self.config.engine.buffer_ring_capacity,
            crate::buffer::DEFAULT_MAX_FINALIZED,
            (self.config.engine.buffer_ttl_secs / 86_400).max(1) as i64,
        ));
        let provisioner = Arc::new(TopicProvisioner::new());
        let grouper = Arc::new(StreamingGrouper::new());
        let cancel = CancellationToken::new();

        let (fanout, fanout_handle, fanout_register_rx) = ResponseFanOut::new(surfaces.clone(), buffer.clone());
        tokio::spawn(fanout.run(fanout_register_rx, cancel.clone()));

        let (raw_tx, raw_rx) = mpsc::channel::<Prompt>(256);
        for source in self.sources {
            tokio::spawn(run_ingress(source, raw_tx.clone(), cancel.clone()));
        }
        drop(raw_tx);

        let (provisioned_tx, provisioned_rx) = mpsc::channel::<Prompt>(256);
        tokio::spawn(run_provisioning(raw_rx, provisioned_tx, surfaces.clone(), provisioner, cancel.clone()));

        let (groups_tx, groups_rx) = mpsc::channel(64);
        tokio::spawn({
            let grouper = grouper.clone();
            let cancel = cancel.clone();
            async move {
                grouper.run(provisioned_rx, groups_tx, |p: &Prompt| p.thread_key().expect("provisioning resolves thread_id before grouping"), cancel).await;
            }
        });

        tokio::spawn(run_dispatch(groups_rx, registry.clone(), factory, fanout_handle));

        tokio::spawn(run_sweep(registry.clone(), buffer.clone(), surfaces.clone(), self.sweep_interval, cancel.clone()));

        EngineHandle { cancel, registry, buffer, surfaces, approvals: self.approvals }
    }
}

/// Resolve each inbound prompt's thread (provisioning a new one on its
/// origin surface when absent) before it reaches the grouper, which assumes
/// every prompt already carries a `thread_id`.
async fn run_provisioning(
    mut raw_rx: mpsc::Receiver<Prompt>,
    out_tx: mpsc::Sender<Prompt>,
    surfaces: Arc<SurfaceRegistry>,
    provisioner: Arc<TopicProvisioner>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe_prompt = raw_rx.recv() => {
                let Some(mut prompt) = maybe_prompt else { break };
                let Some(surface) = surfaces.get(&prompt.surface_id) else {
                    // ProtocolError: reject at the boundary, nothing downstream ever sees it.
                    let kind = crate::error::EngineError::UnknownSurface(prompt.surface_id.clone()).kind();
                    warn!(surface_id = %prompt.surface_id, ?kind, "prompt from an unregistered surface; dropping");
                    continue;
                };
                match provisioner.provision(&prompt, surface.as_ref(), &cancel).await {
                    Ok(key) => {
                        prompt.thread_id = Some(key.thread_id);
                        if out_tx.send(prompt).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let msg = e.to_string();
                        // TransientUpstream: surface I/O hiccup, the loop keeps going.
                        let kind = crate::error::EngineError::Surface(prompt.surface_id.clone(), e).kind();
                        warn!(surface_id = %prompt.surface_id, ?kind, error = %msg, "failed to provision thread for prompt");
                    }
                }
            }
        }
    }
}

/// Spawn one `AgentRunner::run_group` per group as it's opened, registering
/// its output with `ResponseFanOut`.
async fn run_dispatch(mut groups_rx: mpsc::Receiver<crate::grouper::Group>, registry: Arc<ThreadRegistry>, factory: Arc<dyn AgentFactory>, fanout: FanOutHandle) {
    while let Some(group) = groups_rx.recv().await {
        tokio::spawn(run_group(group, registry.clone(), factory.clone(), fanout.sender()));
    }
}

/// Periodically retire threads whose origin surface reports the thread gone,
/// and evict expired `ReconnectionBuffer` entries (spec §4.8 `sweep`).
async fn run_sweep(registry: Arc<ThreadRegistry>, buffer: Arc<ReconnectionBuffer>, surfaces: Arc<SurfaceRegistry>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                registry
                    .sweep(|key: ThreadKey| {
                        let surfaces = surfaces.clone();
                        let cancel = cancel.clone();
                        async move {
                            match surfaces.get(&key.surface_id) {
                                Some(surface) => surface.thread_exists(key.conversation_id, key.thread_id, &cancel).await,
                                None => false,
                            }
                        }
                    })
                    .await;
                buffer.evict_expired();
            }
        }
    }
}

/// Live handle to a started engine: shutdown, reconnection resume, and
/// approval resolution for callers (surfaces, HTTP handlers) outside the
/// engine's own spawned tasks.
pub struct EngineHandle {
    cancel: CancellationToken,
    registry: Arc<ThreadRegistry>,
    buffer: Arc<ReconnectionBuffer>,
    surfaces: Arc<SurfaceRegistry>,
    approvals: Arc<ApprovalStore>,
}

impl EngineHandle {
    /// Cancel every in-flight run and stop accepting new prompts.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the current run for one thread without tearing down the rest
    /// of the engine (spec §4.8 `cancel`).
    pub fn cancel_thread(&self, key: &ThreadKey) {
        self.registry.cancel(key);
    }

    /// Deliver a surface's `ApprovalResolved` follow-up to the suspended tool
    /// call it answers (spec §4.6): the in-flight agent run consumes this as
    /// its resume input rather than a fresh prompt. Returns `false` if no
    /// matching tool call is currently awaiting a decision.
    pub fn resolve_approval(&self, key: &ThreadKey, call_id: &str, approved: bool) -> bool {
        self.approvals.resolve(key, call_id, approved)
    }

    /// Reconstruct the payload needed to resynthesize a reconnecting
    /// client's view of a thread (spec §4.9 `resume`).
    pub fn resume(&self, key: &ThreadKey, last_seen_message_id: Option<&str>, current_streaming_message_id: Option<&str>) -> ResumePayload {
        self.buffer.resume(key, last_seen_message_id, current_streaming_message_id)
    }

    pub fn surfaces(&self) -> &Arc<SurfaceRegistry> {
        &self.surfaces
    }

    pub fn thread_count(&self) -> usize {
        self.registry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::test_support::RecordingSurface;
    use crate::types::UpdateContent;
    use async_trait::async_trait;
    use chrono::Utc;
    use sven_model::ScriptedMockProvider;
    use tokio::sync::Mutex;

    fn prompt(surface_id: &str, conv: i64, body: &str) -> Prompt {
        Prompt {
            surface_id: surface_id.into(),
            conversation_id: conv,
            thread_id: Some(conv),
            agent_id: "A".into(),
            sender_id: "alice".into(),
            body: body.into(),
            timestamp: Utc::now(),
            reply_target: None,
            message_id: format!("{conv}-{body}"),
            thread_name_hint: None,
        }
    }

    /// Yields a fixed batch once, then blocks forever — simulates a
    /// long-polling surface whose backlog is already drained.
    struct OneShotSource {
        surface_id: String,
        prompts: Mutex<Vec<Prompt>>,
    }

    #[async_trait]
    impl PromptSource for OneShotSource {
        fn surface_id(&self) -> &str {
            &self.surface_id
        }

        async fn next_prompts(&self, _cancel: &CancellationToken) -> Vec<Prompt> {
            let mut guard = self.prompts.lock().await;
            if guard.is_empty() {
                std::future::pending::<()>().await;
            }
            std::mem::take(&mut guard)
        }
    }

    #[tokio::test]
    async fn end_to_end_prompt_produces_surface_emit_and_persisted_snapshot() {
        let surface = Arc::new(RecordingSurface::new("test"));
        let model: Arc<dyn ModelProvider> = Arc::new(ScriptedMockProvider::always_text("hello there"));

        let mut engine = Engine::new(Arc::new(Config::default()));
        engine.register_surface(surface.clone());
        engine.register_source(Arc::new(OneShotSource {
            surface_id: "test".into(),
            prompts: Mutex::new(vec![prompt("test", 1, "hi")]),
        }));
        engine.with_model(model);
        engine.with_sweep_interval(Duration::from_secs(3600));

        let handle = engine.start();

        let mut saw_text = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let emitted = surface.emitted.lock().await;
            if emitted.iter().any(|t| matches!(&t.update.contents[..], [UpdateContent::TextDelta(s)] if s == "hello there")) {
                saw_text = true;
                break;
            }
        }
        assert!(saw_text, "expected the scripted reply to reach the surface");

        handle.shutdown();
        assert!(handle.is_shutdown());
    }
}
