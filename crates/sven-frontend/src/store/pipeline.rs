// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `MessagePipeline` — the merge-on-resume algorithm (spec §4.10).

use crate::store::state::ClientMessage;

/// Merge a server resume payload's finalized turns into a topic's existing
/// history.
///
/// Partitions `incoming` into "anchors" (already present in `history`, keyed
/// by `message_id`) and "new" turns (no matching id). Walking `history`, each
/// anchor is enriched in place with any reasoning/tool-calls the incoming
/// turn carries that the existing entry lacks; immediately after an anchor,
/// any new turns that followed it in buffer order are spliced in. New turns
/// that precede the first anchor are inserted at the head; trailing new
/// turns with no following anchor are appended. Content is never duplicated:
/// an incoming turn whose id is already in `history` is merged, never
/// appended twice.
pub fn resume_from_buffer(history: &[ClientMessage], incoming: &[ClientMessage]) -> Vec<ClientMessage> {
    use std::collections::HashMap;

    let history_index: HashMap<&str, usize> =
        history.iter().enumerate().filter_map(|(i, m)| m.message_id.as_deref().map(|id| (id, i))).collect();

    // Group incoming turns by the preceding anchor's position in `history`.
    // `None` means "no anchor seen yet" (goes to the head).
    let mut groups: Vec<(Option<usize>, Vec<&ClientMessage>)> = Vec::new();
    let mut current_anchor: Option<usize> = None;
    let mut current_group: Vec<&ClientMessage> = Vec::new();

    for turn in incoming {
        match turn.message_id.as_deref().and_then(|id| history_index.get(id)) {
            Some(&pos) => {
                groups.push((current_anchor, std::mem::take(&mut current_group)));
                current_anchor = Some(pos);
            }
            None => current_group.push(turn),
        }
    }
    groups.push((current_anchor, current_group));

    let mut enrichments: HashMap<usize, &ClientMessage> = HashMap::new();
    let mut head: Vec<&ClientMessage> = Vec::new();
    let mut after: HashMap<usize, Vec<&ClientMessage>> = HashMap::new();
    for (anchor, group) in &groups {
        match anchor {
            None => head.extend(group.iter().copied()),
            Some(pos) => {
                after.entry(*pos).or_default().extend(group.iter().copied());
            }
        }
    }
    for turn in incoming {
        if let Some(id) = turn.message_id.as_deref() {
            if let Some(&pos) = history_index.get(id) {
                enrichments.insert(pos, turn);
            }
        }
    }

    let mut merged: Vec<ClientMessage> = Vec::with_capacity(history.len() + incoming.len());
    merged.extend(head.into_iter().cloned());
    for (i, existing) in history.iter().enumerate() {
        let entry = match enrichments.get(&i) {
            Some(fresh) => enrich(existing, fresh),
            None => existing.clone(),
        };
        merged.push(entry);
        if let Some(trailing) = after.get(&i) {
            merged.extend(trailing.iter().map(|m| (*m).clone()));
        }
    }

    merged
}

/// Fill in reasoning/tool-calls that `base` lacks but `fresh` carries. Text
/// is assumed already final on `base` once it has a `message_id`.
fn enrich(base: &ClientMessage, fresh: &ClientMessage) -> ClientMessage {
    let mut out = base.clone();
    if out.reasoning.is_empty() && !fresh.reasoning.is_empty() {
        out.reasoning = fresh.reasoning.clone();
    }
    if out.tool_calls.is_empty() && !fresh.tool_calls.is_empty() {
        out.tool_calls = fresh.tool_calls.clone();
    }
    out
}
