// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Pool of running MCP server connections, with scoped acquisition and
//! guaranteed release on every exit path (spec §4.6: `DisposableAgent` needs
//! "scoped acquisition of any embedded MCP tool clients with guaranteed
//! release on every exit path — success, error, or cancel").
//!
//! A `DisposableAgent` lives for exactly one thread-group (one per
//! `ThreadKey`, per `runner::run_group`); it acquires an [`McpConnection`] per
//! server it needs tools from, uses it for the lifetime of the run, and the
//! [`ScopedMcpClient`] guard releases the reference when the agent is
//! disposed — including when disposal happens via early return on error or
//! via the run being cancelled mid-flight.

use std::collections::HashMap;
use std::sync::Arc;

use rmcp::model::{CallToolRequestParams, CallToolResult, Tool as McpToolInfo};
use rmcp::service::RunningService;
use rmcp::{RoleClient, ServiceExt};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::McpServerSpec;
use crate::error::{McpClientError, McpClientResult};

struct McpConnection {
    service: RunningService<RoleClient, ()>,
    tools: Vec<McpToolInfo>,
}

struct PoolEntry {
    spec: McpServerSpec,
    connection: Option<McpConnection>,
    refcount: usize,
}

/// Owns the configured MCP server specs and lazily spawns/reuses connections.
/// One pool per `Engine`; shared across every `DisposableAgent` it constructs.
pub struct McpClientPool {
    entries: Mutex<HashMap<String, PoolEntry>>,
}

impl McpClientPool {
    pub fn new(specs: Vec<McpServerSpec>) -> Self {
        let entries = specs
            .into_iter()
            .map(|spec| (spec.name.clone(), PoolEntry { spec, connection: None, refcount: 0 }))
            .collect();
        Self { entries: Mutex::new(entries) }
    }

    pub fn empty() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Acquire a handle to the named server, spawning it on first use.
    /// Returns a guard that releases the connection's refcount on drop,
    /// regardless of how the caller's scope exits.
    pub async fn acquire(self: &Arc<Self>, server_name: &str) -> McpClientResult<ScopedMcpClient> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(server_name).ok_or_else(|| McpClientError::UnknownServer(server_name.to_string()))?;

        if entry.connection.is_none() {
            let conn = spawn_connection(&entry.spec).await?;
            entry.connection = Some(conn);
        }
        entry.refcount += 1;

        Ok(ScopedMcpClient { pool: self.clone(), server_name: server_name.to_string() })
    }

    async fn release(&self, server_name: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(server_name) {
            entry.refcount = entry.refcount.saturating_sub(1);
            // Connections are kept warm across runs once spawned; only the
            // refcount (used for diagnostics/sweep) is adjusted here. A
            // future idle-timeout sweep could drop `entry.connection` once
            // `refcount` reaches zero and stays there past a grace period.
        }
    }

    async fn list_tools(&self, server_name: &str) -> McpClientResult<Vec<McpToolInfo>> {
        let entries = self.entries.lock().await;
        let entry = entries.get(server_name).ok_or_else(|| McpClientError::UnknownServer(server_name.to_string()))?;
        Ok(entry.connection.as_ref().map(|c| c.tools.clone()).unwrap_or_default())
    }

    async fn call_tool(&self, server_name: &str, tool_name: &str, args: serde_json::Value) -> McpClientResult<CallToolResult> {
        let entries = self.entries.lock().await;
        let entry = entries.get(server_name).ok_or_else(|| McpClientError::UnknownServer(server_name.to_string()))?;
        let conn = entry.connection.as_ref().ok_or_else(|| McpClientError::UnknownServer(server_name.to_string()))?;

        let arguments = match args {
            serde_json::Value::Object(map) => Some(map),
            serde_json::Value::Null => None,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                Some(map)
            }
        };

        conn.service
            .call_tool(CallToolRequestParams { name: tool_name.to_string().into(), arguments })
            .await
            .map_err(|e| McpClientError::Protocol(server_name.to_string(), anyhow::anyhow!(e)))
    }
}

async fn spawn_connection(spec: &McpServerSpec) -> McpClientResult<McpConnection> {
    let mut command = Command::new(&spec.command);
    command.args(&spec.args);
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let transport = rmcp::transport::TokioChildProcess::new(command).map_err(|e| McpClientError::Spawn(spec.name.clone(), e.into()))?;

    let service = ()
        .serve(transport)
        .await
        .map_err(|e| McpClientError::Spawn(spec.name.clone(), anyhow::anyhow!(e)))?;

    let listed = service
        .list_tools(Default::default())
        .await
        .map_err(|e| McpClientError::Protocol(spec.name.clone(), anyhow::anyhow!(e)))?;

    let tools = if spec.allow_tools.is_empty() {
        listed.tools
    } else {
        listed.tools.into_iter().filter(|t| spec.allow_tools.iter().any(|pat| t.name.as_ref() == pat)).collect()
    };

    Ok(McpConnection { service, tools })
}

/// RAII handle returned by [`McpClientPool::acquire`]. Releases the pool's
/// refcount for this server on every exit path — normal drop, early return,
/// panic unwind, or cancellation of the future awaiting it.
pub struct ScopedMcpClient {
    pool: Arc<McpClientPool>,
    server_name: String,
}

impl ScopedMcpClient {
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub async fn list_tools(&self) -> McpClientResult<Vec<McpToolInfo>> {
        self.pool.list_tools(&self.server_name).await
    }

    pub async fn call_tool(&self, tool_name: &str, args: serde_json::Value) -> McpClientResult<CallToolResult> {
        self.pool.call_tool(&self.server_name, tool_name, args).await
    }
}

impl Drop for ScopedMcpClient {
    fn drop(&mut self) {
        let pool = self.pool.clone();
        let server_name = self.server_name.clone();
        tokio::spawn(async move {
            pool.release(&server_name).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_on_unknown_server_fails() {
        let pool = Arc::new(McpClientPool::empty());
        let result = pool.acquire("nonexistent").await;
        assert!(matches!(result, Err(McpClientError::UnknownServer(_))));
    }
}
