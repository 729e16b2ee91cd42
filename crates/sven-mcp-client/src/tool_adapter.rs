// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Adapts one MCP-advertised tool into a [`sven_tools::Tool`] so it can sit
//! in the same [`sven_tools::ToolRegistry`] as the built-ins.

use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::{CallToolResult, Content};
use serde_json::Value;

use sven_tools::policy::ApprovalPolicy;
use sven_tools::tool::{Tool, ToolCall, ToolOutput, ToolOutputPart};

use crate::client::ScopedMcpClient;

/// One MCP tool, bound to the scoped client it was discovered through. The
/// adapter borrows the client only for the lifetime of the enclosing
/// `DisposableAgent` run — it never owns the process.
pub struct McpToolAdapter {
    client: Arc<ScopedMcpClient>,
    name: String,
    description: String,
    parameters_schema: Value,
}

impl McpToolAdapter {
    pub fn new(client: Arc<ScopedMcpClient>, name: impl Into<String>, description: impl Into<String>, parameters_schema: Value) -> Self {
        Self { client, name: name.into(), description: description.into(), parameters_schema }
    }
}

#[async_trait]
impl Tool for McpToolAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.parameters_schema.clone()
    }

    fn default_policy(&self) -> ApprovalPolicy {
        // External MCP servers are untrusted by default; the agent's
        // whitelist (spec §4.6) can still auto-approve specific patterns.
        ApprovalPolicy::Ask
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.client.call_tool(&self.name, call.args.clone()).await {
            Ok(result) => call_result_to_output(&call.id, result),
            Err(err) => ToolOutput::err(&call.id, format!("mcp tool '{}' failed: {}", self.name, err)),
        }
    }
}

fn call_result_to_output(call_id: &str, result: CallToolResult) -> ToolOutput {
    let parts: Vec<ToolOutputPart> = result
        .content
        .into_iter()
        .filter_map(|content| match content.raw {
            rmcp::model::RawContent::Text(text) => Some(ToolOutputPart::Text(text.text)),
            rmcp::model::RawContent::Image(image) => Some(ToolOutputPart::Image(format!("data:{};base64,{}", image.mime_type, image.data))),
            _ => None,
        })
        .collect();

    let parts = if parts.is_empty() { vec![ToolOutputPart::Text(String::new())] } else { parts };
    let mut output = ToolOutput::with_parts(call_id, parts);
    output.is_error = result.is_error.unwrap_or(false);
    output
}
