// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Cron-driven scheduled prompt source (spec §6 "Scheduled runs").
//!
//! `ScheduledSource` is a plain `sven_engine::PromptSource` impl: register it
//! with `Engine::register_source` alongside the surfaces named by its jobs'
//! `surface_id`s (including, optionally, [`null_surface::NullSurface`] for
//! side-effect-only runs) and the engine's normal ingress/grouping/fan-out
//! pipeline carries scheduled prompts exactly like any other surface's.

pub mod config;
pub mod null_surface;
pub mod source;

pub use config::{ScheduledJobSpec, ScheduledJobsConfig};
pub use null_surface::NullSurface;
pub use source::ScheduledSource;
