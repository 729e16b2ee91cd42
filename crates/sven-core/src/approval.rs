// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-call approval gate.
//!
//! [`sven_tools::ToolPolicy`] classifies a tool call as `Auto`/`Ask`/`Deny`
//! from glob patterns in config. `Auto` and `Deny` are resolved immediately;
//! `Ask` suspends that call (its siblings in the same batch keep running)
//! and waits on an [`ApprovalWaiter`] supplied by the host surface — the TUI
//! resolves it from an inline prompt, `sven-node` from a
//! `ControlCommand::ApproveTool` / `DenyTool` arriving on a later request.

use async_trait::async_trait;

/// Resolves a suspended tool call once an operator has made a decision.
///
/// Implementations live outside this crate and are handed to the agent via
/// `Agent::with_approval_gate`. A waiter that never resolves (e.g. the
/// operator disconnects) should eventually return `false` rather than hang
/// the run forever; callers are expected to tie resolution to session
/// teardown.
#[async_trait]
pub trait ApprovalWaiter: Send + Sync {
    /// Block until the operator approves or denies `call_id`.
    /// Returns `true` if approved, `false` if denied.
    async fn wait_for_decision(&self, call_id: &str) -> bool;
}
