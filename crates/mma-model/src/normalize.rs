// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Message normalization: coerce arbitrary message-shaped JSON into the
//! canonical [`Message`] form before it enters a history.
//!
//! LLM SDKs, interpreter wrappers, and legacy transports all hand us
//! slightly different shapes; everything is folded into
//! `{role, content, tool_calls?, tool_call_id?, name?}` here so the rest of
//! the pipeline can rely on one invariant-checked type.

use serde_json::Value;
use uuid::Uuid;

use mma_text::sanitize;

use crate::{FunctionCall, Message, Role, ToolCall};

/// Substituted when a tool result yields no extractable text, so the wire
/// invariant that tool content is a non-empty string holds.
pub const EMPTY_TOOL_CONTENT: &str = "(tool returned no text)";

/// Alternate fields probed, in priority order, when a tool message arrives
/// with empty `content`.
const PRIMARY_OUTPUT_KEYS: [&str; 4] = ["output", "outputs", "result", "results"];
const SECONDARY_OUTPUT_KEYS: [&str; 5] = ["text", "stdout", "stderr", "data", "value"];
const WRAPPER_OUTPUT_KEYS: [&str; 3] = ["tool_result", "tool_response", "tool_outputs"];
const ITEM_TEXT_KEYS: [&str; 5] = ["msg", "message", "text", "result", "content"];

/// Coerce a message-shaped JSON value into a canonical [`Message`].
///
/// - a bare string becomes assistant content;
/// - missing `role` defaults to assistant; legacy `function` becomes `tool`;
/// - `content` is stringified (`null` → empty, structured → JSON-encoded);
/// - empty tool content is recovered from known alternate fields or replaced
///   with [`EMPTY_TOOL_CONTENT`];
/// - `tool_calls` entries are flattened to the canonical shape with ids
///   synthesized when missing;
/// - content is stripped of control characters and ANSI sequences.
pub fn normalize_message(candidate: Value) -> Message {
    let obj = match candidate {
        Value::Object(map) => map,
        Value::String(s) => return Message::assistant(sanitize_for_history(&s)),
        other => return Message::assistant(sanitize_for_history(&other.to_string())),
    };

    let role = match obj.get("role").and_then(Value::as_str).unwrap_or("assistant") {
        "system" => Role::System,
        "user" => Role::User,
        "tool" | "function" => Role::Tool,
        _ => Role::Assistant,
    };

    let mut content = coerce_content(obj.get("content"));

    if role == Role::Tool && content.trim().is_empty() {
        content = extract_tool_content(&obj);
        if content.trim().is_empty() {
            content = EMPTY_TOOL_CONTENT.to_string();
        }
    }

    let tool_calls = match obj.get("tool_calls") {
        Some(Value::Array(entries)) if !entries.is_empty() => {
            Some(entries.iter().map(flatten_tool_call).collect())
        }
        _ => None,
    };

    let tool_call_id = if role == Role::Tool {
        ["tool_call_id", "id", "tool_id"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(str::to_string)
    } else {
        None
    };

    let name = obj.get("name").and_then(Value::as_str).map(str::to_string);

    Message {
        role,
        content: sanitize_for_history(&content),
        tool_calls,
        tool_call_id,
        name,
    }
}

/// Control-char and ANSI stripping applied to every content string before it
/// enters a history.
pub fn sanitize_for_history(text: &str) -> String {
    sanitize::strip_ansi(&sanitize::clean_control_chars(text, true))
}

/// Append with the adjacent-user merge rule: two consecutive plain user
/// messages are concatenated with a blank line instead of appended
/// separately (consecutive user turns trigger 400s on some backends).
pub fn push_merging_adjacent_user(history: &mut Vec<Message>, msg: Message) {
    if msg.role == Role::User && !msg.has_tool_calls() {
        if let Some(last) = history.last_mut() {
            if last.role == Role::User && !last.has_tool_calls() {
                last.content = format!("{}\n\n{}", last.content, msg.content);
                return;
            }
        }
    }
    history.push(msg);
}

/// Synthesize a tool-call id for entries the model emitted without one.
pub fn synthesize_call_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("call_{}", &hex[..12])
}

fn coerce_content(content: Option<&Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Pull readable text out of a tool message whose `content` is empty.
/// Fragments are deduplicated by exact match, order preserved, and joined
/// with newlines.
fn extract_tool_content(obj: &serde_json::Map<String, Value>) -> String {
    let mut fragments: Vec<String> = Vec::new();

    if let Some(out) = PRIMARY_OUTPUT_KEYS.iter().find_map(|k| obj.get(*k)) {
        collect_output_fragments(out, &mut fragments);
    }

    if fragments.is_empty() {
        for key in SECONDARY_OUTPUT_KEYS {
            if let Some(v) = obj.get(key) {
                match v {
                    Value::String(s) if !s.is_empty() => fragments.push(s.clone()),
                    Value::Array(_) | Value::Object(_) => fragments.push(v.to_string()),
                    Value::Null => {}
                    other => fragments.push(other.to_string()),
                }
            }
        }
    }

    if fragments.is_empty() {
        if let Some(v) = WRAPPER_OUTPUT_KEYS.iter().find_map(|k| obj.get(*k)) {
            fragments.push(v.to_string());
        }
    }

    let mut seen = std::collections::HashSet::new();
    let mut parts = Vec::new();
    for frag in fragments {
        let trimmed = frag.trim().to_string();
        if !trimmed.is_empty() && seen.insert(trimmed.clone()) {
            parts.push(trimmed);
        }
    }
    parts.join("\n")
}

fn collect_output_fragments(out: &Value, fragments: &mut Vec<String>) {
    match out {
        Value::Array(items) => {
            for item in items {
                collect_output_fragments(item, fragments);
            }
        }
        Value::Object(map) => {
            // First text-bearing key wins; otherwise keep the whole object.
            let text = ITEM_TEXT_KEYS.iter().find_map(|k| {
                map.get(*k).and_then(|v| match v {
                    Value::String(s) if !s.is_empty() => Some(s.clone()),
                    _ => None,
                })
            });
            match text {
                Some(t) => fragments.push(t),
                None => fragments.push(Value::Object(map.clone()).to_string()),
            }
        }
        Value::String(s) => {
            if !s.is_empty() {
                fragments.push(s.clone());
            }
        }
        Value::Null => {}
        other => fragments.push(other.to_string()),
    }
}

/// Flatten one tool-call entry to the canonical shape.  Structured
/// arguments are JSON-encoded; missing arguments become the empty string;
/// missing ids are synthesized; `type` defaults to `"function"`.
fn flatten_tool_call(entry: &Value) -> ToolCall {
    let id = entry
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(synthesize_call_id);

    let function = entry.get("function");
    let name = function
        .and_then(|f| f.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let arguments = match function.and_then(|f| f.get("arguments")) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(structured) => structured.to_string(),
    };

    let call_type = entry
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("function")
        .to_string();

    ToolCall { id, call_type, function: FunctionCall { name, arguments } }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
