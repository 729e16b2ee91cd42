// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `ReconnectionBuffer` (spec §4.9) — per-thread bounded ring of recent
//! streaming triples with TTL, used to resynthesize the in-flight and
//! recently-completed turns for a reconnecting client.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::types::{CoalescedMessage, StreamTriple, ThreadKey};

/// Retention: TTL 5 days from last write, or ring full (oldest-first
/// eviction), per spec §3 `ThreadBuffer` / §4.9.
pub const DEFAULT_TTL_DAYS: i64 = 5;
const DEFAULT_MAX_ENTRIES: usize = 512;
pub(crate) const DEFAULT_MAX_FINALIZED: usize = 128;

struct ThreadBuffer {
    ring: VecDeque<StreamTriple>,
    finalized: VecDeque<CoalescedMessage>,
    last_write: DateTime<Utc>,
    seq: u64,
}

impl ThreadBuffer {
    fn new() -> Self {
        Self { ring: VecDeque::new(), finalized: VecDeque::new(), last_write: Utc::now(), seq: 0 }
    }

    fn is_expired(&self, ttl: ChronoDuration) -> bool {
        Utc::now() - self.last_write > ttl
    }
}

/// Result of resuming a reconnecting client (spec §4.9).
#[derive(Debug, Clone, Default)]
pub struct ResumePayload {
    /// Finalized messages after the last one the client already has.
    pub finalized: Vec<CoalescedMessage>,
    /// Raw triples since the last turn boundary (in-flight streaming state).
    pub in_flight: Vec<StreamTriple>,
    /// High-water sequence number for future catch-up.
    pub high_water_seq: u64,
}

pub struct ReconnectionBuffer {
    inner: Mutex<HashMap<ThreadKey, ThreadBuffer>>,
    max_entries: usize,
    max_finalized: usize,
    ttl: ChronoDuration,
}

impl Default for ReconnectionBuffer {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            max_entries: DEFAULT_MAX_ENTRIES,
            max_finalized: DEFAULT_MAX_FINALIZED,
            ttl: ChronoDuration::days(DEFAULT_TTL_DAYS),
        }
    }
}

impl ReconnectionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_entries: usize, max_finalized: usize, ttl_days: i64) -> Self {
        Self { max_entries, max_finalized, ttl: ChronoDuration::days(ttl_days), ..Self::default() }
    }

    pub fn append(&self, triple: StreamTriple) {
        let mut map = self.inner.lock().unwrap();
        let buf = map.entry(triple.key.clone()).or_insert_with(ThreadBuffer::new);

        if let Some(msg) = &triple.coalesced {
            buf.finalized.push_back(msg.clone());
            while buf.finalized.len() > self.max_finalized {
                buf.finalized.pop_front();
            }
        }

        buf.ring.push_back(triple);
        while buf.ring.len() > self.max_entries {
            buf.ring.pop_front();
        }
        buf.last_write = Utc::now();
        buf.seq += 1;
    }

    /// Every finalized `CoalescedMessage` emitted on `key` is retrievable
    /// until evicted (spec §8 property 5).
    pub fn finalized(&self, key: &ThreadKey) -> Vec<CoalescedMessage> {
        self.inner.lock().unwrap().get(key).map(|b| b.finalized.iter().cloned().collect()).unwrap_or_default()
    }

    /// Resynthesize the resume payload for a reconnecting client (spec
    /// §4.9): finalized messages after `last_seen_message_id`, and in-flight
    /// triples since the last turn boundary.
    pub fn resume(&self, key: &ThreadKey, last_seen_message_id: Option<&str>, _current_streaming_message_id: Option<&str>) -> ResumePayload {
        let map = self.inner.lock().unwrap();
        let Some(buf) = map.get(key) else {
            return ResumePayload::default();
        };

        let finalized: Vec<CoalescedMessage> = match last_seen_message_id {
            Some(last_id) => match buf.finalized.iter().position(|m| m.message_id == last_id) {
                Some(idx) => buf.finalized.iter().skip(idx + 1).cloned().collect(),
                None => buf.finalized.iter().cloned().collect(),
            },
            None => buf.finalized.iter().cloned().collect(),
        };

        // In-flight: triples in the ring after the most recent turn boundary.
        let last_boundary = buf.ring.iter().rposition(|t| t.is_turn_boundary());
        let in_flight: Vec<StreamTriple> = match last_boundary {
            Some(idx) => buf.ring.iter().skip(idx + 1).cloned().collect(),
            None => buf.ring.iter().cloned().collect(),
        };

        ResumePayload { finalized, in_flight, high_water_seq: buf.seq }
    }

    /// TTL-based eviction sweep. Surface-existence eviction is driven by
    /// `ThreadRegistry::sweep` calling `remove` directly.
    pub fn evict_expired(&self) {
        let mut map = self.inner.lock().unwrap();
        map.retain(|_, buf| !buf.is_expired(self.ttl));
    }

    pub fn remove(&self, key: &ThreadKey) {
        self.inner.lock().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ModelUpdate, UpdateContent};
    use chrono::Utc as ChronoUtc;

    fn key() -> ThreadKey {
        ThreadKey::new("tg", 1, 1, "A")
    }

    fn finalized_triple(key: &ThreadKey, id: &str, text: &str) -> StreamTriple {
        StreamTriple {
            key: key.clone(),
            update: ModelUpdate::stream_complete(1),
            coalesced: Some(CoalescedMessage {
                role: crate::types::MessageRole::Assistant,
                text: text.into(),
                reasoning: String::new(),
                tool_calls: vec![],
                message_id: id.into(),
                sender_id: "bot".into(),
                timestamp: ChronoUtc::now(),
            }),
            pending_message_id: Some(id.into()),
        }
    }

    fn delta_triple(key: &ThreadKey, text: &str) -> StreamTriple {
        StreamTriple { key: key.clone(), update: ModelUpdate::new(1, UpdateContent::TextDelta(text.into())), coalesced: None, pending_message_id: None }
    }

    #[test]
    fn finalized_messages_are_retrievable_after_append() {
        let buf = ReconnectionBuffer::new();
        let k = key();
        buf.append(finalized_triple(&k, "m1", "hello"));
        let found = buf.finalized(&k);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].message_id, "m1");
    }

    #[test]
    fn resume_returns_finalized_messages_after_last_seen() {
        let buf = ReconnectionBuffer::new();
        let k = key();
        buf.append(finalized_triple(&k, "m1", "one"));
        buf.append(finalized_triple(&k, "m2", "two"));
        buf.append(finalized_triple(&k, "m3", "three"));

        let resume = buf.resume(&k, Some("m1"), None);
        assert_eq!(resume.finalized.len(), 2);
        assert_eq!(resume.finalized[0].message_id, "m2");
        assert_eq!(resume.finalized[1].message_id, "m3");
    }

    #[test]
    fn resume_with_no_last_seen_returns_everything() {
        let buf = ReconnectionBuffer::new();
        let k = key();
        buf.append(finalized_triple(&k, "m1", "one"));
        let resume = buf.resume(&k, None, None);
        assert_eq!(resume.finalized.len(), 1);
    }

    #[test]
    fn resume_includes_in_flight_triples_since_last_boundary() {
        let buf = ReconnectionBuffer::new();
        let k = key();
        buf.append(finalized_triple(&k, "m1", "one"));
        buf.append(delta_triple(&k, "typ"));
        buf.append(delta_triple(&k, "ing"));

        let resume = buf.resume(&k, Some("m1"), None);
        assert_eq!(resume.in_flight.len(), 2);
        assert!(resume.finalized.is_empty());
    }

    #[test]
    fn ring_is_bounded_by_max_entries() {
        let buf = ReconnectionBuffer::with_capacity(3, 3, 5);
        let k = key();
        for i in 0..10 {
            buf.append(delta_triple(&k, &i.to_string()));
        }
        let resume = buf.resume(&k, None, None);
        assert_eq!(resume.in_flight.len(), 3);
    }

    #[test]
    fn resume_on_unknown_key_returns_empty_payload() {
        let buf = ReconnectionBuffer::new();
        let resume = buf.resume(&key(), None, None);
        assert!(resume.finalized.is_empty());
        assert!(resume.in_flight.is_empty());
    }

    #[test]
    fn evict_expired_removes_stale_buffers() {
        let buf = ReconnectionBuffer::with_capacity(512, 128, -1); // already-expired TTL
        let k = key();
        buf.append(delta_triple(&k, "x"));
        buf.evict_expired();
        assert!(buf.finalized(&k).is_empty());
        let resume = buf.resume(&k, None, None);
        assert!(resume.in_flight.is_empty());
    }
}
