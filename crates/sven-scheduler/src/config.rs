// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// One configured scheduled prompt (spec §6 "Scheduled runs": `ScheduledPrompt`
/// carries an `agentId`, a prompt body, an optional recurrence expression,
/// and an optional `userId`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJobSpec {
    pub agent_id: String,
    pub body: String,
    /// Standard five- or six-field cron expression. Absent means "run once,
    /// at `sven scheduler` startup, then retire".
    #[serde(default)]
    pub recurrence: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Surface to route the resulting thread through. Must name a surface
    /// registered with the engine; use the scheduler's built-in
    /// [`crate::null_surface::NullSurface`] id for side-effect-only runs.
    pub surface_id: String,
    /// Surface-scoped identity the provisioned thread nests under (e.g. a
    /// Telegram/Discord chat id, or a fixed sentinel for the null surface).
    pub conversation_id: i64,
}

/// Top-level `scheduler.yaml` / config section: a flat list of jobs, loaded
/// the same `#[serde(default)]` way as the rest of `sven-config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduledJobsConfig {
    #[serde(default)]
    pub jobs: Vec<ScheduledJobSpec>,
}
