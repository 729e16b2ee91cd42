// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// The five error kinds spec §7 defines, each with its own propagation
/// policy. Every `EngineError` classifies into exactly one via `kind()`, so
/// the policy below is something call sites branch on, not just prose:
///
/// - `TransientUpstream`: logged, swallowed, the loop continues.
/// - `ToolError`: surfaces as a `ToolResult` update with an error body; the
///   agent run continues.
/// - `AgentError`: becomes a terminating `Error` update for that prompt; the
///   group survives.
/// - `ProtocolError`: rejected at the boundary with a single terminal error.
/// - `Fatal`: process-level; the process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientUpstream,
    ToolError,
    AgentError,
    ProtocolError,
    Fatal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("surface '{0}' not registered")]
    UnknownSurface(String),

    #[error("surface '{0}' error: {1}")]
    Surface(String, #[source] anyhow::Error),

    #[error("failed to construct agent for thread '{0}': {1}")]
    AgentConstruction(String, #[source] anyhow::Error),

    #[error("snapshot store error: {0}")]
    SnapshotStore(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Classify this error into one of spec §7's five kinds, so callers can
    /// branch on propagation policy instead of matching on the variant.
    pub fn kind(&self) -> ErrorKind {
        match self {
            // A prompt naming a surface the engine never registered — reject
            // at the boundary, same as an unregistered user or malformed action.
            EngineError::UnknownSurface(_) => ErrorKind::ProtocolError,
            // Surface I/O (poll failure, send timeout) is a recoverable hiccup.
            EngineError::Surface(..) => ErrorKind::TransientUpstream,
            // Failing to construct an agent for a thread is scoped to that
            // thread's current prompt, not the whole process.
            EngineError::AgentConstruction(..) => ErrorKind::AgentError,
            // Both are startup-time conditions the process cannot run without.
            EngineError::SnapshotStore(_) => ErrorKind::Fatal,
            EngineError::Config(_) => ErrorKind::Fatal,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
