// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `ClientStatePipeline`: the client-side store, pure reducer, and
//! merge-on-resume logic shared by every sven frontend that talks to
//! `sven-engine` over its push surface.

pub mod store;

pub use store::{Action, ClientMessage, ConnectionStatus, PendingApproval, Store, StoreError, StoreState, StreamingSlot, Topic, TopicId, ToolCallSummary};
pub use store::wire::triple_to_actions;
