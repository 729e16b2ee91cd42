// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `TopicProvisioner` (spec §4.2): given a prompt with no thread, materialize
//! a new thread on the originating surface and return a stable `ThreadKey`.
//! Idempotent per `(surfaceConvId, incoming prompt message id)`.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::surface::Surface;
use crate::types::{Prompt, ThreadKey};

/// First 32 glyphs of the prompt body, used as the provisioned thread's name.
/// Counts `char`s (Unicode scalar values), not bytes, so multi-byte glyphs
/// aren't split mid-codepoint.
fn topic_name(body: &str) -> String {
    body.chars().take(32).collect()
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct IdempotencyKey {
    surface_id: String,
    conversation_id: i64,
    message_id: String,
}

/// Idempotent wrapper around `Surface::create_topic_if_needed`.
pub struct TopicProvisioner {
    seen: Mutex<HashMap<IdempotencyKey, ThreadKey>>,
}

impl Default for TopicProvisioner {
    fn default() -> Self {
        Self { seen: Mutex::new(HashMap::new()) }
    }
}

impl TopicProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// `provision(prompt) -> ThreadKey`. Replayed provisions (same surface,
    /// conversation, and source message id) return the same `ThreadKey`
    /// without provisioning a second thread.
    pub async fn provision(&self, prompt: &Prompt, surface: &dyn Surface, cancel: &CancellationToken) -> anyhow::Result<ThreadKey> {
        if let Some(key) = prompt.thread_key() {
            return Ok(key);
        }

        let idem = IdempotencyKey {
            surface_id: prompt.surface_id.clone(),
            conversation_id: prompt.conversation_id,
            message_id: prompt.message_id.clone(),
        };
        if let Some(existing) = self.seen.lock().unwrap().get(&idem) {
            return Ok(existing.clone());
        }

        let name = prompt.thread_name_hint.clone().unwrap_or_else(|| topic_name(&prompt.body));
        let key = surface
            .create_topic_if_needed(prompt.conversation_id, None, &prompt.agent_id, &name, cancel)
            .await?;

        // Echo the prompt back on the new thread as a bolded header.
        surface.begin_turn(&key).await;
        let header = crate::types::StreamTriple {
            key: key.clone(),
            update: crate::types::ModelUpdate::new(0, crate::types::UpdateContent::TextDelta(format!("**{}**", prompt.body))),
            coalesced: None,
            pending_message_id: None,
        };
        surface.emit(&header).await;

        self.seen.lock().unwrap().insert(idem, key.clone());
        Ok(key)
    }
}
