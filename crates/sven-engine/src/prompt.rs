// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `PromptSource` — a lazy, possibly-infinite sequence of `Prompt`s per
//! surface (spec §4.1). Implementations may long-poll, subscribe to a push
//! channel, or read a terminal.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::types::Prompt;

#[async_trait]
pub trait PromptSource: Send + Sync {
    /// Identifies the surface for logging and for `ThreadKey::surface_id`.
    fn surface_id(&self) -> &str;

    /// Pull the next batch of prompts, honoring `cancel`. A fetch failure is
    /// recoverable: implementations must return an empty vec rather than an
    /// `Err`, except when cancelled (in which case returning is also fine —
    /// the ingress loop checks `cancel` itself between calls).
    async fn next_prompts(&self, cancel: &CancellationToken) -> Vec<Prompt>;
}

/// Drives one `PromptSource` into the shared inbound channel until
/// cancelled. One such task runs per surface; `StreamingGrouper` consumes the
/// merge of all of them (spec §2 data flow: "surfaces -> Prompt sequence").
pub async fn run_ingress(source: std::sync::Arc<dyn PromptSource>, tx: mpsc::Sender<Prompt>, cancel: CancellationToken) {
    let surface = source.surface_id().to_string();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let prompts = tokio::select! {
            _ = cancel.cancelled() => break,
            prompts = source.next_prompts(&cancel) => prompts,
        };
        for p in prompts {
            if tx.send(p).await.is_err() {
                // Downstream grouper is gone; nothing more to do.
                return;
            }
        }
    }
    warn!(%surface, "prompt ingress stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSource {
        calls: Arc<AtomicUsize>,
        max_calls: usize,
    }

    #[async_trait]
    impl PromptSource for CountingSource {
        fn surface_id(&self) -> &str {
            "test"
        }

        async fn next_prompts(&self, _cancel: &CancellationToken) -> Vec<Prompt> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n >= self.max_calls {
                // Simulate a long-poll surface that blocks until cancelled.
                std::future::pending::<()>().await;
            }
            vec![Prompt {
                surface_id: "test".into(),
                conversation_id: 1,
                thread_id: Some(1),
                agent_id: "a".into(),
                sender_id: "s".into(),
                body: format!("msg{n}"),
                timestamp: Utc::now(),
                reply_target: None,
                message_id: format!("m{n}"),
                thread_name_hint: None,
            }]
        }
    }

    #[tokio::test]
    async fn ingress_forwards_prompts_until_cancelled() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = Arc::new(CountingSource { calls, max_calls: 2 });

        let cancel2 = cancel.clone();
        let handle = tokio::spawn(run_ingress(source, tx, cancel2));

        // The source yields exactly two prompts, then pends (simulating a
        // blocking long-poll) until the ingress loop observes cancellation.
        let mut received = vec![];
        for _ in 0..2 {
            received.push(rx.recv().await.unwrap());
        }
        cancel.cancel();
        let _ = tokio::time::timeout(std::time::Duration::from_millis(200), handle).await;
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].body, "msg0");
        assert_eq!(received[1].body, "msg1");
    }
}
