// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! MCP client support for sven: connects out to external MCP servers and
//! exposes their tools as ordinary [`sven_tools::Tool`] implementations.
//!
//! A [`McpClientPool`] owns the configured server specs; a `DisposableAgent`
//! (spec §4.6) acquires a [`ScopedMcpClient`] per server it needs for the
//! duration of one thread-group's run and drops it — releasing the
//! connection's refcount — on every exit path.

pub mod client;
pub mod config;
pub mod error;
pub mod tool_adapter;

pub use client::{McpClientPool, ScopedMcpClient};
pub use config::McpServerSpec;
pub use error::{McpClientError, McpClientResult};
pub use tool_adapter::McpToolAdapter;
