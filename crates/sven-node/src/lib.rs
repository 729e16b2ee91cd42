// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The sven gateway: exposes a running agent over HTTP/WebSocket, Slack, and
//! libp2p for remote operators and peer agents.
//!
//! ```no_run
//! use sven_node::config::load;
//!
//! # async fn doc() -> anyhow::Result<()> {
//! let config = load(None)?;
//! # Ok(())
//! # }
//! ```

pub mod agent_builder;
pub mod config;
pub mod control;
pub mod crypto;
pub mod error;
pub mod http;
pub mod node;
pub mod p2p;
pub mod tools;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use node::{
    build_agent_card, default_peers_path, default_token_path, exec_task, list_peers, pair_peer,
    regenerate_token, revoke_peer, run,
};
