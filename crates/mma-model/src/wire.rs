// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Last-hop history hygiene: wire sanitizing, tool-history flattening for
//! backends without the tool role, and the strict pre-send audit.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::error::AuditError;
use crate::normalize::EMPTY_TOOL_CONTENT;
use crate::{Message, Role};

/// Sanitize a history for the wire.
///
/// - tool messages with no `tool_call_id` are matched FIFO against pending
///   (unconsumed) assistant tool-call ids; unmatchable ones are dropped;
/// - tool messages with an id that resolves to no pending call are dropped;
/// - empty tool content is replaced by the standard placeholder;
/// - non-system messages with no content and no tool calls are dropped;
/// - adjacent plain user (and plain assistant) text messages are coalesced.
///
/// A *paired* trailing tool message survives: it is the continuation point
/// of the tool loop and the backend needs it to produce the next turn.
pub fn sanitize_for_wire(history: Vec<Message>) -> Vec<Message> {
    let mut pending: VecDeque<String> = VecDeque::new();
    let mut out: Vec<Message> = Vec::with_capacity(history.len());

    for mut msg in history {
        match msg.role {
            Role::Assistant if msg.has_tool_calls() => {
                for tc in msg.tool_calls.as_ref().unwrap() {
                    pending.push_back(tc.id.clone());
                }
                out.push(msg);
            }
            Role::Tool => {
                let id = match msg.tool_call_id.clone() {
                    Some(id) => {
                        if let Some(pos) = pending.iter().position(|p| *p == id) {
                            pending.remove(pos);
                            Some(id)
                        } else {
                            None
                        }
                    }
                    // Missing id: consume the oldest pending call.
                    None => pending.pop_front(),
                };
                match id {
                    Some(id) => {
                        msg.tool_call_id = Some(id);
                        if msg.content.trim().is_empty() {
                            msg.content = EMPTY_TOOL_CONTENT.to_string();
                        }
                        out.push(msg);
                    }
                    None => {
                        warn!(id = ?msg.tool_call_id, "dropping unmatchable tool message");
                    }
                }
            }
            _ => {
                if msg.role != Role::System && msg.content.trim().is_empty() {
                    debug!(role = ?msg.role, "dropping content-free message");
                    continue;
                }
                // Coalesce runs of plain text messages with the same role.
                if let Some(last) = out.last_mut() {
                    let both_plain = !last.has_tool_calls()
                        && last.role == msg.role
                        && matches!(msg.role, Role::User | Role::Assistant);
                    if both_plain {
                        last.content = format!("{}\n\n{}", last.content, msg.content);
                        continue;
                    }
                }
                out.push(msg);
            }
        }
    }

    out
}

/// Flatten tool history into assistant text for backends that reject the
/// `tool` role (or when the current request carries no tools).
///
/// Each tool message's text is appended to the preceding assistant message
/// (or becomes an assistant message of its own); assistant `tool_calls` are
/// summarised into text and dropped.
pub fn flatten_tool_history(history: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(history.len());

    for msg in history {
        match msg.role {
            Role::Assistant if msg.has_tool_calls() => {
                let calls = msg.tool_calls.unwrap_or_default();
                let described: Vec<String> = calls
                    .iter()
                    .map(|tc| format!("[called {}({})]", tc.function.name, tc.function.arguments))
                    .collect();
                let mut content = msg.content.trim().to_string();
                if !described.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str(&described.join("\n"));
                }
                append_assistant_text(&mut out, &content);
            }
            Role::Tool => {
                let text = format!("[tool result]\n{}", msg.content);
                append_assistant_text(&mut out, &text);
            }
            _ => out.push(msg),
        }
    }
    out
}

fn append_assistant_text(out: &mut Vec<Message>, text: &str) {
    if text.trim().is_empty() {
        return;
    }
    if let Some(last) = out.last_mut() {
        if last.role == Role::Assistant && !last.has_tool_calls() {
            last.content = format!("{}\n\n{}", last.content, text);
            return;
        }
    }
    out.push(Message::assistant(text));
}

/// Strict audit of the message-shape invariants.  Run immediately before
/// the request is serialized; any violation means earlier repair stages
/// failed.
///
/// `tools_enabled` relaxes the trailing-tool rule: a tool-enabled request
/// legitimately ends with the paired results of the last assistant
/// tool-call (that is how the loop continues), while a toolless request
/// must never end on a tool message.
pub fn audit(history: &[Message], tools_enabled: bool) -> Result<(), AuditError> {
    // I1: first non-system message is user (assistant+tool_calls tolerated).
    if let Some((_, first)) = history
        .iter()
        .enumerate()
        .find(|(_, m)| m.role != Role::System)
    {
        let ok = first.role == Role::User
            || (first.role == Role::Assistant && first.has_tool_calls());
        if !ok {
            return Err(AuditError::FirstAfterSystemNotUser {
                found: format!("{:?}", first.role).to_lowercase(),
            });
        }
    }

    // I2: each assistant tool-call is answered before the next assistant turn.
    for (i, msg) in history.iter().enumerate() {
        if msg.role != Role::Assistant || !msg.has_tool_calls() {
            continue;
        }
        for tc in msg.tool_calls.as_ref().unwrap() {
            let mut answered = false;
            for later in &history[i + 1..] {
                if later.role == Role::Tool && later.tool_call_id.as_deref() == Some(&tc.id) {
                    answered = true;
                    break;
                }
                if later.role == Role::Assistant {
                    break;
                }
            }
            if !answered {
                return Err(AuditError::UnansweredToolCall { index: i, id: tc.id.clone() });
            }
        }
    }

    // I3: every tool message resolves backward to an assistant tool call.
    for (i, msg) in history.iter().enumerate() {
        if msg.role != Role::Tool {
            continue;
        }
        let resolved = msg.tool_call_id.as_deref().is_some_and(|id| {
            history[..i].iter().any(|prev| {
                prev.tool_calls
                    .as_ref()
                    .is_some_and(|tcs| tcs.iter().any(|tc| tc.id == id))
            })
        });
        if !resolved {
            return Err(AuditError::OrphanToolMessage {
                index: i,
                id: msg.tool_call_id.clone(),
            });
        }
    }

    // I4: a toolless request never ends on a tool message (tool-enabled
    // requests end on the paired results of the pending call — already
    // covered by I3 above).
    if !tools_enabled && history.last().is_some_and(|m| m.role == Role::Tool) {
        return Err(AuditError::TrailingToolMessage);
    }

    // I5: content is non-empty except for assistants carrying tool calls.
    for (i, msg) in history.iter().enumerate() {
        if msg.content.trim().is_empty() && !msg.has_tool_calls() {
            return Err(AuditError::EmptyContent {
                index: i,
                role: format!("{:?}", msg.role).to_lowercase(),
            });
        }
    }

    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
