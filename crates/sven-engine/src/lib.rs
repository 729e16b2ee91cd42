// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Multi-surface, multi-thread chat orchestration engine.
//!
//! Wires together a merged stream of inbound prompts from one or more
//! `Surface`s, groups them per conversation thread, drives a fresh agent per
//! thread-group, coalesces its streamed output into persisted messages, and
//! fans the result back out to surfaces and reconnecting clients.

pub mod approvals;
pub mod buffer;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod grouper;
pub mod pairer;
pub mod prompt;
pub mod provisioner;
pub mod registry;
pub mod runner;
pub mod surface;
pub mod terminal;
pub mod types;

pub use approvals::ApprovalStore;
pub use buffer::ReconnectionBuffer;
pub use engine::{Engine, EngineHandle};
pub use error::{EngineError, EngineResult};
pub use fanout::{FanOutHandle, ResponseFanOut};
pub use grouper::StreamingGrouper;
pub use pairer::UpdatePairer;
pub use prompt::PromptSource;
pub use provisioner::TopicProvisioner;
pub use registry::{ThreadContext, ThreadRegistry};
pub use runner::{AgentFactory, DisposableAgent, FanOutRegistration, SvenAgentFactory};
pub use surface::{Surface, SurfaceRegistry};
pub use terminal::TerminalSurface;
pub use types::{
    CoalescedMessage, ControlCommand, ModelUpdate, MessageRole, Prompt as EnginePrompt, StreamTriple, ThreadKey, ToolCallSummary, UpdateContent,
};
