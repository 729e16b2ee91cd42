// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Chat surface implementations for external messaging platforms.
//!
//! Each module implements both `sven_engine::Surface` (rendering outbound
//! turns) and `sven_engine::PromptSource` (supplying inbound prompts) for
//! one platform. Register the same `Arc<T>` with the engine's
//! `register_surface` and `register_source` — the trait object coercion
//! handles the rest.

#[cfg(feature = "telegram")]
pub mod telegram;

#[cfg(feature = "discord")]
pub mod discord;
