// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-call pairing: repair of orphaned calls/results before a request is
//! sent, and the safe-cut search used by compaction.
//!
//! Invariant: every assistant tool-call in a wire-bound history has a
//! matching tool result, and every tool result resolves to a preceding
//! assistant tool-call.  Compaction must never cut between a call and its
//! result.

use std::collections::HashSet;

use tracing::debug;

use crate::{Message, Role};

/// Number of trailing messages the safe-cut search preserves by default.
pub const MIN_PRESERVE: usize = 10;

/// Repair orphaned tool pairings in place.
///
/// For each assistant message with `tool_calls`: keep only calls that have a
/// later tool result; if none remain, keep the message as plain text when it
/// has content, otherwise drop it.  Tool messages whose id resolves to no
/// surviving assistant call are dropped.
pub fn repair_tool_pairings(history: &mut Vec<Message>) {
    // Ids answered by some tool message anywhere in the history.
    let answered: HashSet<String> = history
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.clone())
        .collect();

    let mut repaired: Vec<Message> = Vec::with_capacity(history.len());
    // Ids of calls kept on surviving assistant messages so far.
    let mut live_calls: HashSet<String> = HashSet::new();

    for msg in history.drain(..) {
        match msg.role {
            Role::Assistant if msg.has_tool_calls() => {
                let mut msg = msg;
                let calls = msg.tool_calls.take().unwrap_or_default();
                let (matched, unmatched): (Vec<_>, Vec<_>) =
                    calls.into_iter().partition(|tc| answered.contains(&tc.id));
                for tc in &unmatched {
                    debug!(id = %tc.id, "dropping unanswered tool call");
                }
                if !matched.is_empty() {
                    for tc in &matched {
                        live_calls.insert(tc.id.clone());
                    }
                    msg.tool_calls = Some(matched);
                    repaired.push(msg);
                } else if !msg.content.trim().is_empty() {
                    // Keep the assistant text, shed the dead call list.
                    repaired.push(msg);
                } else {
                    debug!("dropping assistant message with only unanswered tool calls");
                }
            }
            Role::Tool => {
                let resolvable = msg
                    .tool_call_id
                    .as_ref()
                    .is_some_and(|id| live_calls.contains(id));
                if resolvable {
                    repaired.push(msg);
                } else {
                    debug!(id = ?msg.tool_call_id, "dropping orphan tool message");
                }
            }
            _ => repaired.push(msg),
        }
    }

    *history = repaired;
}

/// An index is a safe cut point iff every tool message at or after it has
/// its matching assistant tool-call at or after it too.
pub fn is_safe_cut_point(history: &[Message], start: usize) -> bool {
    if start >= history.len() {
        return true;
    }
    for (j, msg) in history.iter().enumerate().skip(start) {
        if msg.role != Role::Tool {
            continue;
        }
        let Some(id) = msg.tool_call_id.as_deref() else {
            continue;
        };
        let matched = history[start..j].iter().any(|prev| {
            prev.tool_calls
                .as_ref()
                .is_some_and(|tcs| tcs.iter().any(|tc| tc.id == id))
        });
        if !matched {
            return false;
        }
    }
    true
}

/// Walk from `len - min_preserve` backward toward 0 and return the first
/// safe cut point; fall back to the last-1 index when none is found.
pub fn find_safe_cut_point(history: &[Message], min_preserve: usize) -> usize {
    if history.is_empty() {
        return 0;
    }
    let preserve = min_preserve.min(history.len());
    let start = history.len() - preserve;
    for i in (0..=start).rev() {
        if is_safe_cut_point(history, i) {
            return i;
        }
    }
    history.len() - 1
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
