// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Token accounting and hard-limit enforcement.
//!
//! Counts cover message `content` only — structural metadata (roles, ids,
//! tool-call wrappers) is excluded.  The soft-limit compaction lives in the
//! core crate next to the agents; this module owns the request-time ceiling.

use tracing::debug;

use crate::{pairing, Message, Role};

/// Marker prefixed to the summary user message produced by compaction.
/// `ensure_first_after_system_user` recognises it when rewriting roles.
pub const SUMMARY_MARKER: &str = "[historical summary — context only, no reply needed]";

/// Minimal user continuation inserted when a history would otherwise start
/// with an assistant turn.
pub const CONTINUATION_USER: &str = "[carrying over prior context] Continue.";

/// Estimate the token count of `text` for `model`.
///
/// All currently supported deployments are close enough to 3 characters per
/// token that a model-specific table has not been worth carrying; the
/// `model` parameter keeps the call sites stable if that changes.  Every
/// message costs at least one token.
pub fn estimate_tokens(model: &str, text: &str) -> usize {
    let _ = model;
    (text.chars().count() / 3).max(1)
}

/// Total token estimate over the concatenated `content` fields.
pub fn history_tokens(model: &str, history: &[Message]) -> usize {
    history.iter().map(|m| estimate_tokens(model, &m.content)).sum()
}

/// Truncate `history` so the total stays within `hard_limit` tokens.
///
/// The first system message is always preserved; the remainder is filled
/// greedily from the tail forward.  Pairings are re-validated afterwards
/// because a cut can separate a tool result from its call.
pub fn enforce_hard_limit(model: &str, history: Vec<Message>, hard_limit: usize) -> Vec<Message> {
    let total = history_tokens(model, &history);
    if total <= hard_limit {
        return history;
    }
    debug!(total, hard_limit, "history over hard token limit, truncating");

    let mut iter = history.into_iter();
    let mut result: Vec<Message> = Vec::new();
    let mut budget_used = 0usize;

    let mut body: Vec<Message> = Vec::new();
    if let Some(first) = iter.next() {
        if first.role == Role::System {
            budget_used += estimate_tokens(model, &first.content);
            result.push(first);
        } else {
            body.push(first);
        }
    }
    body.extend(iter);

    // Greedy suffix: newest messages are the most load-bearing.
    let mut kept_tail: Vec<Message> = Vec::new();
    for msg in body.into_iter().rev() {
        let cost = estimate_tokens(model, &msg.content);
        if budget_used + cost > hard_limit {
            break;
        }
        budget_used += cost;
        kept_tail.push(msg);
    }
    kept_tail.reverse();
    result.extend(kept_tail);

    pairing::repair_tool_pairings(&mut result);
    result
}

/// Enforce invariant I1: after any leading system messages, the first
/// message must be a user turn (an assistant turn opening with `tool_calls`
/// is tolerated, though it cannot occur in practice).
///
/// An assistant message that opens with the compaction summary marker is
/// rewritten to a user role in place; anything else gets a minimal user
/// continuation inserted before it.
pub fn ensure_first_after_system_user(history: &mut Vec<Message>) {
    if history.is_empty() {
        history.push(Message::user(CONTINUATION_USER));
        return;
    }

    let first_non_system = history.iter().position(|m| m.role != Role::System);
    let i = match first_non_system {
        Some(i) => i,
        None => {
            history.push(Message::user(CONTINUATION_USER));
            return;
        }
    };

    match history[i].role {
        Role::User => {}
        Role::Assistant if history[i].has_tool_calls() => {}
        Role::Assistant if history[i].content.trim_start().starts_with("[historical summary") => {
            history[i].role = Role::User;
        }
        _ => history.insert(i, Message::user(CONTINUATION_USER)),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
