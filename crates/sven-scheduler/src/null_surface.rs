// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! A `Surface` that discards everything it's given. Scheduled jobs configured
//! against this surface's id run for their tool side effects only — spec §6
//! "Scheduled runs": "otherwise the prompt is executed silently and only
//! side effects (tool invocations) are observable."

use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio_util::sync::CancellationToken;

use sven_engine::{StreamTriple, Surface, ThreadKey};

/// Well-known id a `ScheduledJobSpec` names to run silently.
pub const NULL_SURFACE_ID: &str = "null";

/// Hands out fresh thread ids on every provision so silent jobs never
/// collide, but never reports a thread as gone — there's nothing for
/// `ThreadRegistry::sweep` to clean up for a surface with no real state.
pub struct NullSurface {
    next_thread_id: AtomicI64,
}

impl Default for NullSurface {
    fn default() -> Self {
        Self { next_thread_id: AtomicI64::new(1) }
    }
}

impl NullSurface {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Surface for NullSurface {
    fn id(&self) -> &str {
        NULL_SURFACE_ID
    }

    fn supports_scheduled_notifications(&self) -> bool {
        false
    }

    async fn provision_thread(&self, _conversation_id: i64, _name: &str, _cancel: &CancellationToken) -> anyhow::Result<i64> {
        Ok(self.next_thread_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn thread_exists(&self, _conversation_id: i64, _thread_id: i64, _cancel: &CancellationToken) -> bool {
        true
    }

    async fn begin_turn(&self, _key: &ThreadKey) {}

    async fn emit(&self, _triple: &StreamTriple) {}

    async fn end_turn(&self, _key: &ThreadKey) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn provisions_sequential_ids_without_error() {
        let surface = NullSurface::new();
        let cancel = CancellationToken::new();
        let a = surface.provision_thread(1, "ignored", &cancel).await.unwrap();
        let b = surface.provision_thread(1, "ignored", &cancel).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn never_reports_scheduled_notifications_support() {
        assert!(!NullSurface::new().supports_scheduled_notifications());
    }
}
