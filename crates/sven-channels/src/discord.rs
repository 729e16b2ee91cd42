// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Discord surface: the gateway client is inherently push-based (serenity
//! dispatches events to an `EventHandler`), so unlike Telegram this adapter
//! buffers inbound messages into an internal channel and `next_prompts`
//! simply drains it — the same shape sven-node's Slack Socket Mode client
//! uses to bridge a push transport into the engine's pull-based
//! `PromptSource` contract.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serenity::all::{ChannelId, GatewayIntents};
use serenity::async_trait as serenity_async_trait;
use serenity::client::{Context, EventHandler};
use serenity::model::channel::Message;
use serenity::Client;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use sven_engine::{EnginePrompt as Prompt, PromptSource, StreamTriple, Surface, ThreadKey};

const IMPLICIT_THREAD_ID: i64 = 0;

struct Handler {
    agent_id: String,
    tx: mpsc::UnboundedSender<Prompt>,
}

#[serenity_async_trait]
impl EventHandler for Handler {
    async fn message(&self, _ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let prompt = Prompt {
            surface_id: DiscordSurface::surface_id().into(),
            conversation_id: msg.channel_id.get() as i64,
            thread_id: Some(IMPLICIT_THREAD_ID),
            agent_id: self.agent_id.clone(),
            sender_id: msg.author.id.get().to_string(),
            body: msg.content.clone(),
            timestamp: Utc::now(),
            reply_target: None,
            message_id: format!("discord:{}:{}", msg.channel_id.get(), msg.id.get()),
            thread_name_hint: None,
        };
        if self.tx.send(prompt).is_err() {
            warn!("discord prompt channel closed; dropping inbound message");
        }
    }
}

/// Owns the serenity `Client` connection (spawned separately via
/// [`DiscordSurface::run_gateway`]) and the channel-based bridge described
/// above.
pub struct DiscordSurface {
    http: Arc<serenity::http::Http>,
    rx: Mutex<mpsc::UnboundedReceiver<Prompt>>,
}

impl DiscordSurface {
    pub fn surface_id() -> &'static str {
        "discord"
    }

    /// Connect to the gateway and return the surface plus a background task
    /// handle. The caller should `tokio::spawn` the returned future — it
    /// runs the serenity client event loop until `cancel` fires.
    pub async fn connect(token: impl Into<String>, agent_id: impl Into<String>, cancel: CancellationToken) -> anyhow::Result<(Self, impl std::future::Future<Output = ()>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let intents = GatewayIntents::GUILD_MESSAGES | GatewayIntents::MESSAGE_CONTENT | GatewayIntents::DIRECT_MESSAGES;
        let mut client = Client::builder(token.into(), intents).event_handler(Handler { agent_id: agent_id.into(), tx }).await?;
        let http = client.http.clone();

        let run = async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = client.start() => {
                    if let Err(err) = result {
                        warn!(error = %err, "discord gateway client exited");
                    }
                }
            }
        };

        Ok((Self { http, rx: Mutex::new(rx) }, run))
    }
}

#[async_trait]
impl PromptSource for DiscordSurface {
    fn surface_id(&self) -> &str {
        Self::surface_id()
    }

    async fn next_prompts(&self, cancel: &CancellationToken) -> Vec<Prompt> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => Vec::new(),
            prompt = rx.recv() => prompt.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Surface for DiscordSurface {
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
        let channel = ChannelId::new(key.conversation_id as u64);
        let _ = channel.broadcast_typing(&self.http).await;
    }

    async fn emit(&self, triple: &StreamTriple) {
        let Some(message) = &triple.coalesced else { return };
        if message.text.is_empty() {
            return;
        }
        let channel = ChannelId::new(triple.key.conversation_id as u64);
        if let Err(err) = channel.say(&self.http, &message.text).await {
            warn!(error = %err, "failed to deliver discord message");
        }
    }

    async fn end_turn(&self, _key: &ThreadKey) {}
}
