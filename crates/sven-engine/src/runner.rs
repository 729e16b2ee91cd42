// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `AgentRunner` (spec §4.4) and `DisposableAgent` (spec §4.6): the
//! per-thread consumer of a `Group`, driving a fresh agent instance per run
//! and turning its event stream into `ModelUpdate`s on the group's behalf.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sven_config::Config;
use sven_core::{Agent, AgentEvent, AgentRuntimeContext};
use sven_model::{Message, ModelProvider};
use sven_tools::{
    DeleteFileTool, EditFileTool, FindFileTool, GrepTool, ListDirTool, ReadFileTool, ReadLintsTool,
    RunTerminalCommandTool, SwitchModeTool, ToolEvent, ToolPolicy, ToolRegistry, TodoWriteTool,
    UpdateMemoryTool, WebFetchTool, WebSearchTool, WriteTool,
};

use crate::approvals::{ApprovalStore, ThreadApprovalWaiter};
use crate::grouper::Group;
use crate::registry::ThreadRegistry;
use crate::types::{ControlCommand, ModelUpdate, Prompt, ThreadKey, UpdateContent};

/// A run-scoped agent: constructed fresh per group (spec §4.6), driven
/// through zero or more prompts, and disposed when the group completes.
#[async_trait]
pub trait DisposableAgent: Send {
    /// Submit one user prompt and stream the resulting updates until the
    /// turn completes or `cancel` fires. `id` is the starting sequence
    /// number for emitted `ModelUpdate`s; the agent advances it internally.
    async fn run_streaming(&self, prompt_text: String, first_id: u64, cancel: CancellationToken, out: mpsc::Sender<ModelUpdate>);

    /// Opaque serialized conversation history, persisted via `ThreadContext`.
    fn serialize_thread(&self) -> Vec<u8>;

    /// Restore conversation history from a previously serialized snapshot.
    /// A malformed snapshot is logged and ignored — the run continues with
    /// empty history rather than failing outright.
    async fn deserialize_thread(&self, snapshot: &[u8]);

    /// Release any resources held by this run. Default no-op.
    async fn dispose(&self) {}
}

/// Builds a fresh `DisposableAgent` for a thread's first prompt (spec §4.6:
/// "constructed once per thread-group lifetime, not once per prompt").
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn construct(&self, key: &ThreadKey) -> anyhow::Result<Box<dyn DisposableAgent>>;
}

/// Wraps `sven_core::Agent` behind a mutex so overlapping prompt tasks for
/// the same group serialize their model calls while the group's own
/// prompt-consuming loop never blocks on an in-flight run (spec §4.4: "at
/// most one `DisposableAgent` per thread, NOT at most one model request in
/// flight").
pub struct SvenDisposableAgent {
    agent: Arc<Mutex<Agent>>,
}

impl SvenDisposableAgent {
    pub fn new(agent: Agent) -> Self {
        Self { agent: Arc::new(Mutex::new(agent)) }
    }
}

#[async_trait]
impl DisposableAgent for SvenDisposableAgent {
    async fn run_streaming(&self, prompt_text: String, first_id: u64, cancel: CancellationToken, out: mpsc::Sender<ModelUpdate>) {
        let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(256);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let bridge = cancel.clone();
        tokio::spawn(async move {
            bridge.cancelled().await;
            let _ = cancel_tx.send(());
        });

        let agent = self.agent.clone();
        let run_handle = tokio::spawn(async move {
            let mut agent = agent.lock().await;
            if let Err(e) = agent.submit_with_cancel(&prompt_text, event_tx, cancel_rx).await {
                warn!(error = %e, "agent run failed");
            }
        });

        forward_events(event_rx, first_id, out).await;
        let _ = run_handle.await;
    }

    fn serialize_thread(&self) -> Vec<u8> {
        let agent = match self.agent.try_lock() {
            Ok(guard) => guard,
            // A serialize racing a live run is rare (only happens if the
            // caller snapshots concurrently with dispatch); skip rather than
            // block the registry's single lock behind a model call.
            Err(_) => return Vec::new(),
        };
        serde_json::to_vec(&agent.session().messages).unwrap_or_default()
    }

    async fn deserialize_thread(&self, snapshot: &[u8]) {
        if snapshot.is_empty() {
            return;
        }
        match serde_json::from_slice::<Vec<Message>>(snapshot) {
            Ok(messages) => {
                let mut agent = self.agent.lock().await;
                agent.session_mut().replace_messages(messages);
            }
            Err(e) => warn!(error = %e, "discarding malformed thread snapshot"),
        }
    }
}

/// Translate one `AgentEvent` stream into `ModelUpdate`s with a monotonic id
/// (spec §3: "`id` advances monotonically for all updates belonging to a
/// single response"). Events with no engine-level counterpart (token usage,
/// compaction stats, mode/todo updates — internal agent bookkeeping) are not
/// forwarded, mirroring `agent_event_to_control`'s drop list.
async fn forward_events(mut event_rx: mpsc::Receiver<AgentEvent>, first_id: u64, out: mpsc::Sender<ModelUpdate>) {
    let mut id = first_id;
    let mut next = |content: UpdateContent| -> ModelUpdate {
        let update = ModelUpdate::new(id, content);
        id += 1;
        update
    };

    while let Some(event) = event_rx.recv().await {
        let update = match event {
            AgentEvent::TextDelta(s) => next(UpdateContent::TextDelta(s)),
            AgentEvent::ThinkingDelta(s) => next(UpdateContent::ReasoningDelta(s)),
            AgentEvent::ToolCallStarted(tc) => next(UpdateContent::ToolCallStart { call_id: tc.id, tool_name: tc.name }),
            AgentEvent::ToolCallFinished { call_id, tool_name, output, is_error } => {
                next(UpdateContent::ToolResult { call_id, tool_name, output, is_error })
            }
            AgentEvent::ToolApprovalRequested { call_id, tool_name, args } => {
                next(UpdateContent::ToolApprovalRequested { call_id, tool_name, args })
            }
            AgentEvent::TurnComplete => next(UpdateContent::StreamComplete),
            AgentEvent::Aborted { partial_text } => {
                if !partial_text.is_empty() {
                    let _ = out.send(next(UpdateContent::TextDelta(partial_text))).await;
                }
                next(UpdateContent::StreamComplete)
            }
            AgentEvent::Error(msg) => next(UpdateContent::Error(msg)),
            // TextComplete/ThinkingComplete duplicate content already carried
            // by the deltas; TokenUsage/ContextCompacted/TodoUpdate/ModeChanged
            // and the question events are TUI-only bookkeeping with no engine
            // counterpart.
            _ => continue,
        };
        if out.send(update).await.is_err() {
            break;
        }
    }
}

/// Standard, non-interactive tool set registered for every engine-driven
/// agent: filesystem, shell, search and memory tools, minus anything that
/// assumes a live human at a terminal (no `AskQuestionTool`) or a P2P swarm.
fn build_tool_registry(config: &Config, mode: Arc<Mutex<sven_config::AgentMode>>, tool_tx: mpsc::Sender<ToolEvent>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(RunTerminalCommandTool::default());
    registry.register(ReadFileTool);
    registry.register(WriteTool);
    registry.register(EditFileTool);
    registry.register(FindFileTool);
    registry.register(GrepTool);
    registry.register(ListDirTool);
    registry.register(DeleteFileTool);
    registry.register(WebFetchTool);
    registry.register(WebSearchTool { api_key: config.tools.web.search.api_key.clone() });
    registry.register(ReadLintsTool);
    registry.register(UpdateMemoryTool { memory_file: config.tools.memory.memory_file.clone() });
    registry.register(TodoWriteTool::new(Arc::new(Mutex::new(Vec::new())), tool_tx.clone()));
    registry.register(SwitchModeTool::new(mode, tool_tx));
    registry
}

/// Default `AgentFactory`: one agent per thread, tool-approval-gated through
/// the engine's `ApprovalStore`, sharing a single model provider instance.
pub struct SvenAgentFactory {
    config: Arc<Config>,
    model: Arc<dyn ModelProvider>,
    approvals: Arc<ApprovalStore>,
}

impl SvenAgentFactory {
    pub fn new(config: Arc<Config>, model: Arc<dyn ModelProvider>, approvals: Arc<ApprovalStore>) -> Self {
        Self { config, model, approvals }
    }
}

#[async_trait]
impl AgentFactory for SvenAgentFactory {
    async fn construct(&self, key: &ThreadKey) -> anyhow::Result<Box<dyn DisposableAgent>> {
        let max_ctx = self.model.catalog_context_window().unwrap_or(128_000) as usize;
        let mode = Arc::new(Mutex::new(self.config.agent.default_mode));
        let (tool_tx, tool_rx) = mpsc::channel::<ToolEvent>(64);
        let registry = build_tool_registry(&self.config, mode.clone(), tool_tx);

        let policy = Arc::new(ToolPolicy::from_config_with_whitelist(
            &self.config.tools,
            &self.config.engine.approval_whitelist_patterns,
        ));
        let waiter = Arc::new(ThreadApprovalWaiter { store: self.approvals.clone(), key: key.clone() });

        let agent = Agent::new(
            self.model.clone(),
            Arc::new(registry),
            Arc::new(self.config.agent.clone()),
            AgentRuntimeContext::default(),
            mode,
            tool_rx,
            max_ctx,
        )
        .with_approval_gate(policy, waiter);

        Ok(Box::new(SvenDisposableAgent::new(agent)))
    }
}

/// One per-group output channel, registered with `ResponseFanOut` once at
/// group start and shared by every prompt run belonging to that group (spec
/// §4.7: "per-key heads are selected round-robin" requires one source per
/// key, not one merged source for every key in the engine).
pub type FanOutRegistration = (ThreadKey, mpsc::Receiver<ModelUpdate>);

/// Drive one group end to end (spec §4.4): construct the agent from the
/// first prompt, hydrate prior history, dispatch control commands, run
/// prompts through the agent with per-prompt cancellation, and dispose on
/// group exhaustion.
pub async fn run_group(mut group: Group, registry: Arc<ThreadRegistry>, factory: Arc<dyn AgentFactory>, fanout_register: mpsc::UnboundedSender<FanOutRegistration>) {
    let key = group.key.clone();
    let ctx = registry.hydrate(&key).await;
    ctx.set_on_clear({
        let handle = group.completion_handle();
        Box::new(move || handle.complete())
    });

    let agent: Arc<dyn DisposableAgent> = match factory.construct(&key).await {
        Ok(a) => Arc::from(a),
        Err(e) => {
            let msg = e.to_string();
            // AgentError: scoped to this group's thread, not the process.
            let kind = crate::error::EngineError::AgentConstruction(key.to_string(), e).kind();
            warn!(%key, ?kind, error = %msg, "failed to construct agent for thread");
            group.complete();
            return;
        }
    };
    if let Some(snapshot) = ctx.snapshot() {
        agent.deserialize_thread(&snapshot).await;
    }

    let (group_tx, group_rx) = mpsc::channel::<ModelUpdate>(256);
    if fanout_register.send((key.clone(), group_rx)).is_err() {
        warn!(%key, "fan-out is no longer accepting registrations; dropping group");
        group.complete();
        return;
    }

    let mut next_id: u64 = 0;
    let mut in_flight = Vec::new();

    while let Some(prompt) = group.prompts.recv().await {
        match ControlCommand::parse(&prompt.body) {
            ControlCommand::Cancel => {
                debug!(%key, "cancel command received");
                ctx.trip_cancel();
            }
            ControlCommand::Clear => {
                debug!(%key, "clear command received");
                registry.clear(&key).await;
                break;
            }
            ControlCommand::None => {
                in_flight.retain(|h: &tokio::task::JoinHandle<()>| !h.is_finished());
                let run_cancel = ctx.arm_cancel();
                let handle = spawn_prompt_run(agent.clone(), prompt, next_id, run_cancel, group_tx.clone());
                next_id += 1;
                in_flight.push(handle);
            }
        }
    }

    for handle in in_flight {
        let _ = handle.await;
    }
    drop(group_tx);
    ctx.disarm_cancel();
    registry.persist_snapshot(&key, agent.serialize_thread()).await;
    agent.dispose().await;
    group.complete();
}

/// Spawn one prompt's run as an independent task so the group's
/// prompt-consuming loop can proceed to the next prompt immediately; actual
/// model calls still serialize through `SvenDisposableAgent`'s internal
/// mutex. All prompts in a group share the same output sender, so
/// `ResponseFanOut` sees one ordered per-key stream regardless of how many
/// runs overlap.
fn spawn_prompt_run(agent: Arc<dyn DisposableAgent>, prompt: Prompt, first_id: u64, cancel: CancellationToken, out: mpsc::Sender<ModelUpdate>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        agent.run_streaming(prompt.body, first_id, cancel, out).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouper::StreamingGrouper;
    use crate::registry::InMemorySnapshotStore;
    use chrono::Utc;
    use sven_model::ScriptedMockProvider;
    use tokio::sync::Mutex as AsyncMutex;

    fn key() -> ThreadKey {
        ThreadKey::new("test", 1, 1, "A")
    }

    fn prompt(body: &str) -> Prompt {
        Prompt {
            surface_id: "test".into(),
            conversation_id: 1,
            thread_id: Some(1),
            agent_id: "A".into(),
            sender_id: "alice".into(),
            body: body.into(),
            timestamp: Utc::now(),
            reply_target: None,
            message_id: format!("m-{body}"),
            thread_name_hint: None,
        }
    }

    fn registry_tools() -> (ToolRegistry, mpsc::Receiver<ToolEvent>, Arc<AsyncMutex<sven_config::AgentMode>>) {
        let mode = Arc::new(AsyncMutex::new(sven_config::AgentMode::Agent));
        let (tx, rx) = mpsc::channel(8);
        (build_tool_registry(&Config::default(), mode.clone(), tx), rx, mode)
    }

    fn make_agent(model: Arc<dyn ModelProvider>) -> Agent {
        let (registry, tool_rx, mode) = registry_tools();
        Agent::new(model, Arc::new(registry), Arc::new(sven_config::AgentConfig::default()), AgentRuntimeContext::default(), mode, tool_rx, 128_000)
    }

    struct ScriptedFactory;

    #[async_trait]
    impl AgentFactory for ScriptedFactory {
        async fn construct(&self, _key: &ThreadKey) -> anyhow::Result<Box<dyn DisposableAgent>> {
            let model: Arc<dyn ModelProvider> = Arc::new(ScriptedMockProvider::always_text("hi there"));
            Ok(Box::new(SvenDisposableAgent::new(make_agent(model))))
        }
    }

    #[tokio::test]
    async fn disposable_agent_streams_text_then_completes() {
        let model: Arc<dyn ModelProvider> = Arc::new(ScriptedMockProvider::always_text("hello"));
        let agent: Arc<dyn DisposableAgent> = Arc::new(SvenDisposableAgent::new(make_agent(model)));
        let (tx, mut rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        agent.run_streaming("hi".into(), 0, cancel, tx).await;

        let mut saw_text = false;
        let mut saw_complete = false;
        while let Some(update) = rx.recv().await {
            for c in update.contents {
                match c {
                    UpdateContent::TextDelta(t) if t == "hello" => saw_text = true,
                    UpdateContent::StreamComplete => saw_complete = true,
                    _ => {}
                }
            }
        }
        assert!(saw_text);
        assert!(saw_complete);
    }

    #[tokio::test]
    async fn serialize_then_deserialize_round_trips_history() {
        let model: Arc<dyn ModelProvider> = Arc::new(ScriptedMockProvider::always_text("hello"));
        let agent = SvenDisposableAgent::new(make_agent(model));
        let (tx, mut rx) = mpsc::channel(32);
        agent.run_streaming("hi".into(), 0, CancellationToken::new(), tx).await;
        while rx.recv().await.is_some() {}

        let snapshot = agent.serialize_thread();
        assert!(!snapshot.is_empty());

        let model2: Arc<dyn ModelProvider> = Arc::new(ScriptedMockProvider::always_text("ignored"));
        let restored = SvenDisposableAgent::new(make_agent(model2));
        restored.deserialize_thread(&snapshot).await;
        assert_eq!(restored.serialize_thread(), snapshot);
    }

    #[tokio::test]
    async fn run_group_persists_snapshot_and_completes_group_on_exhaustion() {
        let grouper = Arc::new(StreamingGrouper::new());
        let (in_tx, in_rx) = mpsc::channel(8);
        let (groups_tx, mut groups_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        in_tx.send(prompt("hello")).await.unwrap();
        drop(in_tx);
        let key_fn = |p: &Prompt| ThreadKey::new(p.surface_id.clone(), p.conversation_id, p.thread_id.unwrap(), p.agent_id.clone());
        grouper.run(in_rx, groups_tx, key_fn, cancel).await;
        let group = groups_rx.recv().await.unwrap();

        let thread_registry = Arc::new(ThreadRegistry::new(Arc::new(InMemorySnapshotStore::default())));
        let (register_tx, mut register_rx) = mpsc::unbounded_channel::<FanOutRegistration>();
        let k = key();
        let registry_clone = thread_registry.clone();
        let drain = tokio::spawn(async move {
            while let Some((_, mut rx)) = register_rx.recv().await {
                tokio::spawn(async move { while rx.recv().await.is_some() {} });
            }
        });
        run_group(group, thread_registry.clone(), Arc::new(ScriptedFactory), register_tx).await;
        let _ = drain.await;

        assert!(registry_clone.resolve(&k).snapshot().is_some());
    }
}
