// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Summarization-based history compaction.
//!
//! The head of the history (everything before a safe cut point) is replaced
//! by a single summary user message; the tail — at least the last ten
//! messages — survives verbatim, with tool-call pairings kept intact by the
//! safe-cut search.  Summarizer failures degrade to a fixed placeholder and
//! never abort the outer call.

use tracing::{info, warn};

use mma_model::{governor, pairing, LlmClient, Message, Role, SUMMARY_MARKER};

const SUMMARIZE_SYSTEM_PROMPT: &str = "You are a conversation compaction assistant. Compress \
the dialogue given by the user into a summary of at most 600 characters. Preserve task goals, \
constraints, conclusions, and the steps already completed. Output the summary text only.";

const SUMMARY_FALLBACK: &str = "(earlier conversation omitted; summary unavailable)";

/// Per-message cap applied when serialising history into the summarization
/// request.
const SUMMARY_INPUT_CAP: usize = 2000;

/// Compact `history` in place.  No-op when no safe head exists to
/// summarize.  After rebuilding, shrinks the preserved tail up to three
/// times if the result still exceeds `hard_limit` tokens; the final
/// fallback keeps only the system message and the summary.
pub async fn compact_history(client: &LlmClient, history: &mut Vec<Message>, hard_limit: usize) {
    let cut = pairing::find_safe_cut_point(history, pairing::MIN_PRESERVE);

    let system_msg = history.first().filter(|m| m.role == Role::System).cloned();
    let head_start = usize::from(system_msg.is_some());
    if cut <= head_start {
        return;
    }

    let head = &history[head_start..cut];
    let summary = match client
        .auxiliary_chat(SUMMARIZE_SYSTEM_PROMPT, &format_for_summary(head))
        .await
    {
        Ok(s) if !s.trim().is_empty() => s,
        Ok(_) => {
            warn!("summarizer returned empty text, using placeholder");
            SUMMARY_FALLBACK.to_string()
        }
        Err(e) => {
            warn!("summarization failed, using placeholder: {e}");
            SUMMARY_FALLBACK.to_string()
        }
    };

    let tail: Vec<Message> = history[cut..].to_vec();
    let before = history.len();
    rebuild(history, &system_msg, &summary, &tail);
    info!(before, after = history.len(), "history compacted");

    // The summary plus tail can still exceed the request ceiling when the
    // tail itself is huge; shrink it a few times before giving up on it.
    let model = client.model().to_string();
    let mut keep = tail.len();
    for _ in 0..3 {
        if governor::history_tokens(&model, history) <= hard_limit {
            return;
        }
        keep /= 2;
        if keep == 0 {
            break;
        }
        let sub_cut = pairing::find_safe_cut_point(&tail, keep);
        rebuild(history, &system_msg, &summary, &tail[sub_cut..]);
    }

    if governor::history_tokens(&model, history) > hard_limit {
        warn!("tail still over hard limit after shrinking, keeping summary only");
        rebuild(history, &system_msg, &summary, &[]);
    }
}

fn rebuild(history: &mut Vec<Message>, system_msg: &Option<Message>, summary: &str, tail: &[Message]) {
    history.clear();
    if let Some(sys) = system_msg {
        history.push(sys.clone());
    }
    history.push(Message::user(format!("{SUMMARY_MARKER}\n{summary}")));
    history.extend_from_slice(tail);
    governor::ensure_first_after_system_user(history);
}

/// `role: content` lines, each capped at [`SUMMARY_INPUT_CAP`] characters.
fn format_for_summary(head: &[Message]) -> String {
    head.iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            let content: String = if m.content.chars().count() > SUMMARY_INPUT_CAP {
                let truncated: String = m.content.chars().take(SUMMARY_INPUT_CAP).collect();
                format!("{truncated}...")
            } else {
                m.content.clone()
            };
            format!("{role}: {content}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use mma_channel::NullPublisher;
    use mma_config::{AgentKind, BehaviorConfig, LimitsConfig, LlmConfig};
    use mma_model::mock::ScriptedStep;
    use mma_model::{ScriptedTransport, ToolCall};

    fn client(transport: Arc<ScriptedTransport>) -> LlmClient {
        LlmClient::new(
            "task-1",
            AgentKind::System,
            &LlmConfig { model: "test-model".into(), ..LlmConfig::default() },
            &LimitsConfig::default(),
            &BehaviorConfig::default(),
            transport,
            Arc::new(NullPublisher),
        )
    }

    fn long_history(pairs: usize) -> Vec<Message> {
        let mut h = vec![Message::system("system prompt")];
        for i in 0..pairs {
            h.push(Message::user(format!("user message number {i} with some padding text")));
            h.push(Message::assistant(format!("assistant reply number {i} with padding")));
        }
        h
    }

    #[tokio::test]
    async fn short_history_is_left_untouched() {
        let transport = Arc::new(ScriptedTransport::text("summary"));
        let c = client(transport.clone());
        let mut h = long_history(3); // 7 messages, all inside the preserved tail
        let before = h.clone();
        compact_history(&c, &mut h, 100_000).await;
        assert_eq!(h, before);
        assert_eq!(transport.request_count(), 0, "nothing to summarize");
    }

    #[tokio::test]
    async fn head_replaced_by_summary_user_message() {
        let transport = Arc::new(ScriptedTransport::text("condensed head"));
        let c = client(transport.clone());
        let mut h = long_history(10); // 21 messages
        compact_history(&c, &mut h, 100_000).await;

        assert_eq!(h[0].role, Role::System);
        assert_eq!(h[1].role, Role::User);
        assert!(h[1].content.starts_with(SUMMARY_MARKER));
        assert!(h[1].content.contains("condensed head"));
        // system + summary + 10 preserved.
        assert_eq!(h.len(), 12);
    }

    #[tokio::test]
    async fn last_ten_messages_preserved_verbatim() {
        let transport = Arc::new(ScriptedTransport::text("s"));
        let c = client(transport);
        let mut h = long_history(10);
        let expected_tail: Vec<Message> = h[h.len() - 10..].to_vec();
        let expected_system = h[0].clone();
        compact_history(&c, &mut h, 100_000).await;
        assert_eq!(h[0], expected_system);
        assert_eq!(&h[h.len() - 10..], expected_tail.as_slice());
    }

    #[tokio::test]
    async fn summarizer_sees_capped_role_prefixed_lines() {
        let transport = Arc::new(ScriptedTransport::text("s"));
        let c = client(transport.clone());
        let mut h = vec![Message::system("sys")];
        h.push(Message::user("x".repeat(5000)));
        for i in 0..10 {
            h.push(Message::user(format!("filler {i}")));
            h.push(Message::assistant(format!("filler reply {i}")));
        }
        compact_history(&c, &mut h, 100_000).await;

        let req = &transport.requests()[0];
        let sent_user = req["messages"][1]["content"].as_str().unwrap();
        assert!(sent_user.contains("user: xxxx"));
        // The 5000-char message is truncated to the cap plus an ellipsis.
        let x_run = sent_user.chars().filter(|&ch| ch == 'x').count();
        assert_eq!(x_run, 2000);
    }

    #[tokio::test]
    async fn summarizer_failure_degrades_to_placeholder() {
        let transport = Arc::new(ScriptedTransport::new(vec![ScriptedStep::Fail(|| {
            mma_model::LlmError::BadRequest("no".into())
        })]));
        let c = client(transport);
        let mut h = long_history(10);
        compact_history(&c, &mut h, 100_000).await;
        assert!(h[1].content.contains("summary unavailable"));
        assert_eq!(h[1].role, Role::User);
    }

    #[tokio::test]
    async fn compaction_never_orphans_tool_pairs() {
        let transport = Arc::new(ScriptedTransport::text("s"));
        let c = client(transport);
        // Build a history whose natural cut would land between a call and
        // its result; the safe-cut search must move it.
        let mut h = vec![Message::system("sys")];
        for i in 0..8 {
            h.push(Message::user(format!("u{i}")));
            h.push(Message::assistant(format!("a{i}")));
        }
        h.push(Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::function("c1", "execute_code", "{}")],
        ));
        h.push(Message::tool_result("c1", "execute_code", "out"));
        for i in 0..4 {
            h.push(Message::user(format!("post{i}")));
            h.push(Message::assistant(format!("postr{i}")));
        }
        compact_history(&c, &mut h, 100_000).await;

        for (j, m) in h.iter().enumerate() {
            if m.role == Role::Tool {
                let id = m.tool_call_id.as_deref().unwrap();
                let paired = h[..j].iter().any(|prev| {
                    prev.tool_calls
                        .as_ref()
                        .is_some_and(|tcs| tcs.iter().any(|tc| tc.id == id))
                });
                assert!(paired, "tool message at {j} lost its call");
            }
        }
    }

    #[tokio::test]
    async fn oversized_tail_shrinks_toward_hard_limit() {
        let transport = Arc::new(ScriptedTransport::text("tiny"));
        let c = client(transport);
        let mut h = vec![Message::system("sys")];
        for i in 0..20 {
            h.push(Message::user(format!("{i} {}", "y".repeat(400))));
            h.push(Message::assistant(format!("{i} {}", "z".repeat(400))));
        }
        // Each message ≈ 135 tokens; a 10-message tail ≈ 1350 tokens.
        compact_history(&c, &mut h, 500).await;
        let total = governor::history_tokens("test-model", &h);
        assert!(total <= 500 || h.len() <= 2, "tail must shrink or collapse to summary only");
    }

    #[tokio::test]
    async fn compacted_history_starts_with_user_after_system() {
        let transport = Arc::new(ScriptedTransport::text("s"));
        let c = client(transport);
        let mut h = long_history(12);
        compact_history(&c, &mut h, 100_000).await;
        let first_non_system = h.iter().find(|m| m.role != Role::System).unwrap();
        assert_eq!(first_non_system.role, Role::User);
    }
}
