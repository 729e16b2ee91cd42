// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Telegram surface: long-polls `getUpdates` as a [`PromptSource`] and
//! renders finalized turns back via `sendMessage` as a [`Surface`].
//!
//! Generalizes the webhook-to-agent bridging pattern sven-node's Slack
//! integration uses (verify/parse inbound, dispatch to the engine, render
//! the response) to a pull-based transport: Telegram's Bot API has no
//! notion of a long-lived duplex socket, so `next_prompts` itself performs
//! the long poll.

use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use teloxide::payloads::GetUpdatesSetters;
use teloxide::requests::Requester;
use teloxide::types::{ChatAction, UpdateKind};
use teloxide::Bot;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sven_engine::{EnginePrompt as Prompt, PromptSource, StreamTriple, Surface, ThreadKey};

const LONG_POLL_TIMEOUT_SECS: u32 = 30;

/// A single Telegram chat is treated as a single implicit thread: Telegram
/// has no stable server-issued sub-conversation id comparable to Slack's
/// thread timestamp, so every prompt in a chat maps to `thread_id = 0`.
const IMPLICIT_THREAD_ID: i64 = 0;

pub struct TelegramSurface {
    bot: Bot,
    agent_id: String,
    next_offset: AtomicI32,
    typing_sent: Mutex<std::collections::HashSet<ThreadKey>>,
}

impl TelegramSurface {
    pub fn new(token: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self { bot: Bot::new(token), agent_id: agent_id.into(), next_offset: AtomicI32::new(0), typing_sent: Mutex::new(Default::default()) }
    }

    pub fn surface_id() -> &'static str {
        "telegram"
    }
}

#[async_trait]
impl PromptSource for TelegramSurface {
    fn surface_id(&self) -> &str {
        Self::surface_id()
    }

    async fn next_prompts(&self, cancel: &CancellationToken) -> Vec<Prompt> {
        let offset = self.next_offset.load(Ordering::SeqCst);
        let updates = tokio::select! {
            _ = cancel.cancelled() => return Vec::new(),
            result = self.bot.get_updates().offset(offset).timeout(LONG_POLL_TIMEOUT_SECS).send() => result,
        };

        let updates = match updates {
            Ok(u) => u,
            Err(err) => {
                warn!(error = %err, "telegram getUpdates failed");
                return Vec::new();
            }
        };

        let mut prompts = Vec::new();
        let mut max_seen = offset;
        for update in updates {
            max_seen = max_seen.max(update.id.0 as i32 + 1);
            let UpdateKind::Message(message) = update.kind else { continue };
            let Some(text) = message.text() else { continue };
            let sender_id = message.from().map(|u| u.id.0.to_string()).unwrap_or_else(|| "unknown".into());

            prompts.push(Prompt {
                surface_id: Self::surface_id().into(),
                conversation_id: message.chat.id.0,
                thread_id: Some(IMPLICIT_THREAD_ID),
                agent_id: self.agent_id.clone(),
                sender_id,
                body: text.to_string(),
                timestamp: Utc::now(),
                reply_target: None,
                message_id: format!("telegram:{}:{}", message.chat.id.0, message.id.0),
                thread_name_hint: None,
            });
        }
        self.next_offset.store(max_seen, Ordering::SeqCst);
        prompts
    }
}

#[async_trait]
impl Surface for TelegramSurface {
    fn id(&self) -> &str {
        Self::surface_id()
    }

    async fn provision_thread(&self, _conversation_id: i64, _name: &str, _cancel: &CancellationToken) -> anyhow::Result<i64> {
        Ok(IMPLICIT_THREAD_ID)
    }

    async fn thread_exists(&self, _conversation_id: i64, thread_id: i64, _cancel: &CancellationToken) -> bool {
        thread_id == IMPLICIT_THREAD_ID
    }

    async fn begin_turn(&self, key: &ThreadKey) {
        let mut sent = self.typing_sent.lock().await;
        if sent.insert(key.clone()) {
            let chat_id = teloxide::types::ChatId(key.conversation_id);
            if let Err(err) = self.bot.send_chat_action(chat_id, ChatAction::Typing).await {
                debug!(error = %err, "failed to send telegram typing indicator");
            }
        }
    }

    async fn emit(&self, triple: &StreamTriple) {
        let Some(message) = &triple.coalesced else { return };
        if message.text.is_empty() {
            return;
        }
        let chat_id = teloxide::types::ChatId(triple.key.conversation_id);
        if let Err(err) = self.bot.send_message(chat_id, &message.text).await {
            warn!(error = %err, "failed to deliver telegram message");
        }
    }

    async fn end_turn(&self, key: &ThreadKey) {
        self.typing_sent.lock().await.remove(key);
    }
}
