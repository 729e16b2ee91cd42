// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `ResponseFanOut` (spec §4.7) — merges the per-key output streams from all
//! currently-open groups into one globally-ordered dispatch to surfaces and
//! `ReconnectionBuffer`.
//!
//! Each group registers its own `mpsc::Receiver<ModelUpdate>` (see
//! `runner::run_group`) rather than sharing one channel across every thread
//! in the engine; `StreamMap` then polls every registered key in rotation,
//! so a surface sink that blocks on one key's `emit` only pauses that key's
//! source — sibling keys keep draining.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::buffer::ReconnectionBuffer;
use crate::pairer::UpdatePairer;
use crate::runner::FanOutRegistration;
use crate::surface::SurfaceRegistry;
use crate::types::{ModelUpdate, ThreadKey};

/// Handle for registering a newly started group's output stream with a
/// running `ResponseFanOut`. Cheap to clone; held by whoever spawns groups
/// (the engine's ingress loop).
#[derive(Clone)]
pub struct FanOutHandle {
    register: mpsc::UnboundedSender<FanOutRegistration>,
}

impl FanOutHandle {
    pub fn register(&self, key: ThreadKey, updates: mpsc::Receiver<ModelUpdate>) {
        if self.register.send((key.clone(), updates)).is_err() {
            warn!(%key, "response fan-out has shut down; dropping group registration");
        }
    }

    /// The raw sender, handed to `run_group` so it can register itself
    /// directly without routing through this handle.
    pub fn sender(&self) -> mpsc::UnboundedSender<FanOutRegistration> {
        self.register.clone()
    }
}

/// Per-key bookkeeping the fan-out keeps alongside its `StreamMap` entry:
/// a pairer to coalesce deltas into messages, and whether a turn is
/// currently open on the surface (so `begin_turn`/`end_turn` bracket exactly
/// one turn each, even though `TextDelta`s arrive one `ModelUpdate` at a time).
struct KeyState {
    pairer: UpdatePairer,
    turn_open: bool,
}

pub struct ResponseFanOut {
    surfaces: Arc<SurfaceRegistry>,
    buffer: Arc<ReconnectionBuffer>,
}

impl ResponseFanOut {
    /// Construct alongside the raw registration channel; `run` consumes the
    /// receiver directly, so the caller (the engine) decides when the merge
    /// loop actually starts.
    pub fn new(surfaces: Arc<SurfaceRegistry>, buffer: Arc<ReconnectionBuffer>) -> (Arc<Self>, FanOutHandle, mpsc::UnboundedReceiver<FanOutRegistration>) {
        let (register, register_rx) = mpsc::unbounded_channel();
        let fanout = Arc::new(Self { surfaces, buffer });
        let handle = FanOutHandle { register };
        (fanout, handle, register_rx)
    }

    /// Run the fair merge loop until `cancel` fires. New per-key streams are
    /// admitted as they're registered; finished streams drop out of the
    /// `StreamMap` automatically once their sender side closes.
    pub async fn run(self: Arc<Self>, mut register_rx: mpsc::UnboundedReceiver<FanOutRegistration>, cancel: CancellationToken) {
        let mut streams: StreamMap<ThreadKey, ReceiverStream<ModelUpdate>> = StreamMap::new();
        let mut states: HashMap<ThreadKey, KeyState> = HashMap::new();
        let mut registrations_open = true;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                maybe_reg = register_rx.recv(), if registrations_open => {
                    match maybe_reg {
                        Some((key, rx)) => {
                            states.insert(key.clone(), KeyState { pairer: UpdatePairer::new(key.clone(), key.agent_id.clone()), turn_open: false });
                            streams.insert(key, ReceiverStream::new(rx));
                        }
                        None => registrations_open = false,
                    }
                }

                Some((key, update)) = streams.next(), if !streams.is_empty() => {
                    self.dispatch(&mut states, key, update).await;
                }

                else => {
                    if !registrations_open && streams.is_empty() {
                        break;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, states: &mut HashMap<ThreadKey, KeyState>, key: ThreadKey, update: ModelUpdate) {
        let Some(state) = states.get_mut(&key) else {
            warn!(%key, "received update for a key with no registered state");
            return;
        };

        let Some(surface) = self.surfaces.get(&key.surface_id) else {
            warn!(%key, "received update for an unregistered surface");
            return;
        };

        if !state.turn_open {
            surface.begin_turn(&key).await;
            state.turn_open = true;
        }

        let triple = state.pairer.push(update);
        let boundary = triple.is_turn_boundary();

        surface.emit(&triple).await;
        self.buffer.append(triple);

        if boundary {
            surface.end_turn(&key).await;
            state.turn_open = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::test_support::RecordingSurface;
    use crate::types::UpdateContent;

    fn key() -> ThreadKey {
        ThreadKey::new("test", 1, 1, "A")
    }

    #[tokio::test]
    async fn merges_single_key_stream_into_surface_emits() {
        let mut registry = SurfaceRegistry::new();
        let surface = Arc::new(RecordingSurface::new("test"));
        registry.register(surface.clone());
        let (fanout, handle, register_rx) = ResponseFanOut::new(Arc::new(registry), Arc::new(ReconnectionBuffer::new()));

        let (tx, rx) = mpsc::channel(8);
        handle.register(key(), rx);
        tx.send(ModelUpdate::new(0, UpdateContent::TextDelta("hi".into()))).await.unwrap();
        tx.send(ModelUpdate::stream_complete(1)).await.unwrap();
        drop(tx);
        drop(handle);

        let cancel = CancellationToken::new();
        fanout.run(register_rx, cancel).await;

        let emitted = surface.emitted.lock().await;
        assert_eq!(emitted.len(), 2);
        assert_eq!(surface.turns_begun.lock().await.len(), 1);
        assert_eq!(surface.turns_ended.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn appends_every_emitted_triple_to_the_reconnection_buffer() {
        let mut registry = SurfaceRegistry::new();
        let surface = Arc::new(RecordingSurface::new("test"));
        registry.register(surface.clone());
        let buffer = Arc::new(ReconnectionBuffer::new());
        let (fanout, handle, register_rx) = ResponseFanOut::new(Arc::new(registry), buffer.clone());

        let (tx, rx) = mpsc::channel(8);
        handle.register(key(), rx);
        tx.send(ModelUpdate::new(0, UpdateContent::TextDelta("hello".into()))).await.unwrap();
        tx.send(ModelUpdate::stream_complete(1)).await.unwrap();
        drop(tx);
        drop(handle);

        fanout.run(register_rx, CancellationToken::new()).await;

        let finalized = buffer.finalized(&key());
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].text, "hello");
    }

    #[tokio::test]
    async fn two_keys_each_get_their_own_begin_and_end_turn() {
        let mut registry = SurfaceRegistry::new();
        let surface = Arc::new(RecordingSurface::new("test"));
        registry.register(surface.clone());
        let (fanout, handle, register_rx) = ResponseFanOut::new(Arc::new(registry), Arc::new(ReconnectionBuffer::new()));

        let key_a = ThreadKey::new("test", 1, 1, "A");
        let key_b = ThreadKey::new("test", 1, 2, "A");

        let (tx_a, rx_a) = mpsc::channel(8);
        let (tx_b, rx_b) = mpsc::channel(8);
        handle.register(key_a.clone(), rx_a);
        handle.register(key_b.clone(), rx_b);

        tx_a.send(ModelUpdate::new(0, UpdateContent::TextDelta("a".into()))).await.unwrap();
        tx_a.send(ModelUpdate::stream_complete(1)).await.unwrap();
        tx_b.send(ModelUpdate::new(0, UpdateContent::TextDelta("b".into()))).await.unwrap();
        tx_b.send(ModelUpdate::stream_complete(1)).await.unwrap();
        drop(tx_a);
        drop(tx_b);
        drop(handle);

        fanout.run(register_rx, CancellationToken::new()).await;

        assert_eq!(surface.turns_begun.lock().await.len(), 2);
        assert_eq!(surface.turns_ended.lock().await.len(), 2);
        assert_eq!(surface.emitted.lock().await.len(), 4);
    }

    #[tokio::test]
    async fn updates_for_an_unregistered_surface_are_dropped_not_fatal() {
        let registry = SurfaceRegistry::new();
        let (fanout, handle, register_rx) = ResponseFanOut::new(Arc::new(registry), Arc::new(ReconnectionBuffer::new()));

        let (tx, rx) = mpsc::channel(8);
        handle.register(key(), rx);
        tx.send(ModelUpdate::new(0, UpdateContent::TextDelta("hi".into()))).await.unwrap();
        drop(tx);
        drop(handle);

        fanout.run(register_rx, CancellationToken::new()).await;
    }
}
