// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Launch spec for one external MCP server, configured under
/// `mcp_servers.<name>` in `sven.toml` alongside the rest of [`sven_config::Config`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Only tools matching these name patterns are exposed to the agent.
    /// Empty means "all tools the server advertises".
    #[serde(default)]
    pub allow_tools: Vec<String>,
}
