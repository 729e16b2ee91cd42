// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `ThreadRegistry` — `resolve`/`cancel`/`clear`/`sweep` behind a single mutex
//! (spec §4.8, DESIGN NOTES "shared mutable registries keyed by tuple").
//! The registry owns `ThreadContext` exclusively; nothing outside this module
//! reaches into the underlying map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::types::ThreadKey;

/// Persists serialized agent-thread snapshots, keyed by `ThreadKey`, TTL 30
/// days from last touch (spec §6 "Persisted state layout"). The concrete
/// backend (kv-store) is an external collaborator; the engine only needs this
/// narrow contract.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, key: &ThreadKey) -> Option<Vec<u8>>;
    async fn save(&self, key: &ThreadKey, snapshot: Vec<u8>);
    async fn delete(&self, key: &ThreadKey);
}

/// In-memory `SnapshotStore` for tests and for hosts that don't need
/// cross-process resume (the CLI terminal surface, CI).
#[derive(Default)]
pub struct InMemorySnapshotStore {
    inner: Mutex<HashMap<ThreadKey, Vec<u8>>>,
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn load(&self, key: &ThreadKey) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    async fn save(&self, key: &ThreadKey, snapshot: Vec<u8>) {
        self.inner.lock().unwrap().insert(key.clone(), snapshot);
    }

    async fn delete(&self, key: &ThreadKey) {
        self.inner.lock().unwrap().remove(key);
    }
}

/// Per-thread mutable companion (spec §3 `ThreadContext`).
///
/// States: `Idle -> Running -> (Cancelled | Cleared) -> Idle` (spec §4.11).
/// `Running` is implicit (a cancel token is armed); `Cancelled` is transient —
/// the cancel token is tripped, the current run unwinds, and the context
/// returns to `Idle` with a fresh (unarmed) slot. `Cleared` removes the
/// context from the registry entirely.
pub struct ThreadContext {
    pub key: ThreadKey,
    /// The current run's cancel handle. `None` when idle.
    cancel: Mutex<Option<CancellationToken>>,
    /// Invoked exactly once, only on `clear()` — closes the inbound prompt
    /// group (spec §4.4 step 2: "Register `sub.complete()` as a completion
    /// callback").
    on_clear: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    snapshot: Mutex<Option<Vec<u8>>>,
}

impl ThreadContext {
    fn new(key: ThreadKey) -> Self {
        Self {
            key,
            cancel: Mutex::new(None),
            on_clear: Mutex::new(None),
            snapshot: Mutex::new(None),
        }
    }

    /// Arm a fresh cancel handle for a new run, replacing any previous one.
    /// "At most one live cancel handle per key" (spec §3 invariant).
    pub fn arm_cancel(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap() = Some(token.clone());
        token
    }

    /// Clear the cancel handle once the run that armed it has finished.
    pub fn disarm_cancel(&self) {
        *self.cancel.lock().unwrap() = None;
    }

    /// Trip the current cancel handle, if any. Re-arms are left to the next
    /// run — the entry itself stays in place (spec §4.8 `cancel`).
    pub fn trip_cancel(&self) {
        if let Some(token) = self.cancel.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    pub fn set_on_clear(&self, cb: Box<dyn FnOnce() + Send>) {
        *self.on_clear.lock().unwrap() = Some(cb);
    }

    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.snapshot.lock().unwrap().clone()
    }

    pub fn set_snapshot(&self, bytes: Vec<u8>) {
        *self.snapshot.lock().unwrap() = Some(bytes);
    }
}

/// Mapping `ThreadKey -> ThreadContext` (spec §4.8). All operations are
/// linearizable under a single internal lock.
pub struct ThreadRegistry {
    inner: Mutex<HashMap<ThreadKey, Arc<ThreadContext>>>,
    store: Arc<dyn SnapshotStore>,
}

impl ThreadRegistry {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self { inner: Mutex::new(HashMap::new()), store }
    }

    /// Creates on miss; on hit, returns the existing context even if a prior
    /// run has finished (spec §4.8 `resolve`).
    pub fn resolve(&self, key: &ThreadKey) -> Arc<ThreadContext> {
        let mut map = self.inner.lock().unwrap();
        map.entry(key.clone())
            .or_insert_with(|| {
                info!(%key, "thread context created");
                Arc::new(ThreadContext::new(key.clone()))
            })
            .clone()
    }

    /// Load the persisted snapshot for `key`, if any, into a freshly resolved
    /// context. Call once, before the first run for a key.
    pub async fn hydrate(&self, key: &ThreadKey) -> Arc<ThreadContext> {
        let ctx = self.resolve(key);
        if ctx.snapshot().is_none() {
            if let Some(bytes) = self.store.load(key).await {
                ctx.set_snapshot(bytes);
            }
        }
        ctx
    }

    /// Persist the context's current snapshot to the backing store.
    pub async fn persist_snapshot(&self, key: &ThreadKey, bytes: Vec<u8>) {
        let ctx = self.resolve(key);
        ctx.set_snapshot(bytes.clone());
        self.store.save(key, bytes).await;
    }

    /// Trips the cancel handle; leaves the entry in place (spec §4.8).
    pub fn cancel(&self, key: &ThreadKey) {
        if let Some(ctx) = self.inner.lock().unwrap().get(key) {
            ctx.trip_cancel();
        }
    }

    /// Cancels and removes; also deletes the persisted snapshot (spec §4.8).
    pub async fn clear(&self, key: &ThreadKey) {
        let ctx = self.inner.lock().unwrap().remove(key);
        if let Some(ctx) = ctx {
            ctx.trip_cancel();
            let cb = ctx.on_clear.lock().unwrap().take();
            if let Some(cb) = cb {
                cb();
            }
            info!(%key, "thread context cleared");
        }
        self.store.delete(key).await;
    }

    /// Periodically probes the origin surface via `threadExists(key)`; on
    /// `false`, performs `clear` (spec §4.8 `sweep`).
    pub async fn sweep<F, Fut>(&self, thread_exists: F)
    where
        F: Fn(ThreadKey) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let keys: Vec<ThreadKey> = self.inner.lock().unwrap().keys().cloned().collect();
        for key in keys {
            if !thread_exists(key.clone()).await {
                self.clear(&key).await;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(n: i64) -> ThreadKey {
        ThreadKey::new("test", n, n, "agent")
    }

    #[tokio::test]
    async fn resolve_creates_on_miss_and_returns_same_on_hit() {
        let reg = ThreadRegistry::new(Arc::new(InMemorySnapshotStore::default()));
        let k = key(1);
        let a = reg.resolve(&k);
        let b = reg.resolve(&k);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn cancel_trips_token_but_leaves_entry() {
        let reg = ThreadRegistry::new(Arc::new(InMemorySnapshotStore::default()));
        let k = key(1);
        let ctx = reg.resolve(&k);
        let token = ctx.arm_cancel();
        assert!(!token.is_cancelled());
        reg.cancel(&k);
        assert!(token.is_cancelled());
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn clear_removes_entry_and_invokes_on_clear_once() {
        let reg = ThreadRegistry::new(Arc::new(InMemorySnapshotStore::default()));
        let k = key(1);
        let ctx = reg.resolve(&k);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        ctx.set_on_clear(Box::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        reg.clear(&k).await;
        assert_eq!(reg.len(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_deletes_persisted_snapshot() {
        let store = Arc::new(InMemorySnapshotStore::default());
        let reg = ThreadRegistry::new(store.clone());
        let k = key(1);
        reg.persist_snapshot(&k, vec![1, 2, 3]).await;
        assert!(store.load(&k).await.is_some());
        reg.clear(&k).await;
        assert!(store.load(&k).await.is_none());
    }

    #[tokio::test]
    async fn hydrate_loads_snapshot_from_store() {
        let store = Arc::new(InMemorySnapshotStore::default());
        let k = key(1);
        store.save(&k, vec![9, 9]).await;
        let reg = ThreadRegistry::new(store);
        let ctx = reg.hydrate(&k).await;
        assert_eq!(ctx.snapshot(), Some(vec![9, 9]));
    }

    #[tokio::test]
    async fn sweep_clears_threads_whose_surface_reports_gone() {
        let reg = ThreadRegistry::new(Arc::new(InMemorySnapshotStore::default()));
        reg.resolve(&key(1));
        reg.resolve(&key(2));
        reg.sweep(|k| async move { k.conversation_id != 1 }).await;
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn cancel_on_nonexistent_key_does_not_panic() {
        let reg = ThreadRegistry::new(Arc::new(InMemorySnapshotStore::default()));
        reg.cancel(&key(42));
    }
}
