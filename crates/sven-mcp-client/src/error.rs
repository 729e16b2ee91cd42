// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum McpClientError {
    #[error("mcp server '{0}' is not configured")]
    UnknownServer(String),

    #[error("failed to spawn mcp server '{0}': {1}")]
    Spawn(String, #[source] anyhow::Error),

    #[error("mcp server '{0}' protocol error: {1}")]
    Protocol(String, #[source] anyhow::Error),

    #[error("mcp tool '{0}' not found on server '{1}'")]
    UnknownTool(String, String),
}

pub type McpClientResult<T> = Result<T, McpClientError>;
