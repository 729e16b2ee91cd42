// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sven_model::Message;
use uuid::Uuid;

/// One saved turn in the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub role: String,
    pub content: String,
}

/// In-memory conversation session.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    /// Approximate total token count for the current message list
    pub token_count: usize,
    /// Maximum context tokens (set from model config / provider limits)
    pub max_tokens: usize,
    /// Maximum output tokens the active model will produce in one completion.
    /// Reserved out of the context window when computing `input_budget()`.
    pub max_output_tokens: usize,
    /// Token overhead of items sent with every request but not tracked in
    /// `messages` (tool schemas, dynamic context block). Recomputed by the
    /// agent loop before each turn via `estimate_schema_overhead`.
    pub schema_overhead: usize,
    /// Running total of cache-read tokens across the session's lifetime.
    pub cache_read_total: u32,
    /// Running total of cache-write tokens across the session's lifetime.
    pub cache_write_total: u32,
    /// Correction factor applied to the chars/4 token estimate, refined from
    /// the provider's actual reported input token counts as the session
    /// progresses. Starts at 1.0 (no correction).
    pub calibration_factor: f32,
}

impl Session {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            max_output_tokens: 0,
            schema_overhead: 0,
            cache_read_total: 0,
            cache_write_total: 0,
            calibration_factor: 1.0,
        }
    }

    /// Tokens available for request input: context window minus the reserved
    /// output budget. Returns 0 if the output reservation would not fit,
    /// signaling callers to skip budget-based compaction entirely.
    pub fn input_budget(&self) -> usize {
        self.max_tokens.saturating_sub(self.max_output_tokens)
    }

    /// Fold a turn's cache usage into the running totals.
    pub fn add_cache_usage(&mut self, cache_read_tokens: u32, cache_write_tokens: u32) {
        self.cache_read_total += cache_read_tokens;
        self.cache_write_total += cache_write_tokens;
    }

    /// Refine `calibration_factor` from a provider's actual reported input
    /// token count versus this crate's chars/4 estimate for the same request.
    /// Exponential moving average (weight 0.3 on the new sample) so a single
    /// noisy report cannot swing the factor drastically.
    pub fn update_calibration(&mut self, actual_input: u32, estimated: usize) {
        if estimated == 0 {
            return;
        }
        let sample = actual_input as f32 / estimated as f32;
        const ALPHA: f32 = 0.3;
        self.calibration_factor = self.calibration_factor * (1.0 - ALPHA) + sample * ALPHA;
        // Clamp to a sane range; a wildly off sample (e.g. from a provider
        // that didn't report usage correctly) should not derail future budget
        // math.
        self.calibration_factor = self.calibration_factor.clamp(0.25, 4.0);
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs { self.push(m); }
    }

    /// Fraction of context window consumed (0.0–1.0)
    pub fn context_fraction(&self) -> f32 {
        if self.max_tokens == 0 { return 0.0; }
        (self.token_count as f32) / (self.max_tokens as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Recalculate token count from scratch (call after compaction).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    /// Replace the message list and recalculate token count (for resubmit / edit).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
