// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The coordinator: a single-shot strict-JSON agent that decomposes the raw
//! problem statement into numbered questions.

use std::sync::Arc;
use std::sync::OnceLock;

use anyhow::{bail, Context};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::info;

use mma_channel::Publisher;
use mma_config::LimitsConfig;
use mma_model::{ChatOptions, LlmClient, Message};
use mma_text::{json_fix, sanitize};

use crate::agent::AgentCore;
use crate::prompts;

fn ques_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^ques(\d+)$").unwrap())
}

/// Parsed coordinator output: the questions object plus the derived count.
#[derive(Debug, Clone)]
pub struct CoordinatorOutput {
    pub questions: Map<String, Value>,
    pub ques_count: u32,
}

impl CoordinatorOutput {
    /// The `quesN` keys in numeric order.
    pub fn ques_keys(&self) -> Vec<String> {
        let mut numbered: Vec<(u32, String)> = self
            .questions
            .keys()
            .filter_map(|k| {
                ques_key_re()
                    .captures(k)
                    .and_then(|c| c[1].parse().ok())
                    .map(|n| (n, k.clone()))
            })
            .collect();
        numbered.sort_by_key(|(n, _)| *n);
        numbered.into_iter().map(|(_, k)| k).collect()
    }

    pub fn background(&self) -> &str {
        self.questions.get("background").and_then(Value::as_str).unwrap_or_default()
    }
}

pub struct CoordinatorAgent {
    core: AgentCore,
}

impl CoordinatorAgent {
    pub fn new(client: Arc<LlmClient>, publisher: Arc<dyn Publisher>, limits: &LimitsConfig) -> Self {
        Self { core: AgentCore::new(client, publisher, limits) }
    }

    /// Decompose the raw problem statement.  JSON parse failures are fatal
    /// for the workflow — there is nothing to hand to the modeler without a
    /// question breakdown.
    pub async fn run(&mut self, ques_all: &str) -> anyhow::Result<CoordinatorOutput> {
        self.core.init_system(prompts::COORDINATOR_PROMPT).await;
        self.core.append(Message::user(ques_all)).await;

        // The client publishes the parsed object as the structured panel
        // payload for this agent kind.
        let turn = self.core.chat(&ChatOptions::default()).await?;

        let cleaned = sanitize::normalize_common_glitches(&sanitize::clean_control_chars(
            &turn.content,
            true,
        ));
        self.core.append(Message::assistant(cleaned.clone())).await;

        // Strict mode: no LLM rebuild, a null result aborts the subtask.
        let (obj, stage) = json_fix::fix_and_parse(&cleaned, None).await;
        let questions = obj.with_context(|| {
            format!("coordinator returned unparseable JSON ({stage}): {cleaned}")
        })?;

        let ques_count = derive_ques_count(&questions)?;
        info!(ques_count, "coordinator decomposed the problem");
        Ok(CoordinatorOutput { questions, ques_count })
    }
}

/// `ques_count` from the object, or inferred from the highest `quesN` key.
fn derive_ques_count(questions: &Map<String, Value>) -> anyhow::Result<u32> {
    if let Some(n) = questions.get("ques_count").and_then(Value::as_u64) {
        return Ok(n as u32);
    }
    let max = questions
        .keys()
        .filter_map(|k| ques_key_re().captures(k))
        .filter_map(|c| c[1].parse::<u32>().ok())
        .max();
    match max {
        Some(n) => Ok(n),
        None => bail!("coordinator output has neither ques_count nor any quesN key"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mma_channel::{MemoryPublisher, NullPublisher, PayloadKind};
    use mma_config::{AgentKind, BehaviorConfig, LlmConfig};
    use mma_model::ScriptedTransport;

    fn coordinator(transport: Arc<ScriptedTransport>, publisher: Arc<dyn Publisher>) -> CoordinatorAgent {
        let limits = LimitsConfig::default();
        let client = Arc::new(LlmClient::new(
            "task-1",
            AgentKind::Coordinator,
            &LlmConfig { model: "test-model".into(), ..LlmConfig::default() },
            &limits,
            &BehaviorConfig::default(),
            transport,
            publisher.clone(),
        ));
        CoordinatorAgent::new(client, publisher, &limits)
    }

    const GOOD_JSON: &str = r#"{"title": "Fish stocks", "background": "bg", "ques_count": 2, "ques1": "model growth", "ques2": "optimize catch"}"#;

    #[tokio::test]
    async fn parses_strict_json_output() {
        let transport = Arc::new(ScriptedTransport::text(GOOD_JSON));
        let mut c = coordinator(transport, Arc::new(NullPublisher));
        let out = c.run("the problem text").await.unwrap();
        assert_eq!(out.ques_count, 2);
        assert_eq!(out.ques_keys(), vec!["ques1", "ques2"]);
        assert_eq!(out.background(), "bg");
    }

    #[tokio::test]
    async fn fenced_output_still_parses() {
        let transport = Arc::new(ScriptedTransport::text(format!(
            "Here you go:\n```json\n{GOOD_JSON}\n```"
        )));
        let mut c = coordinator(transport, Arc::new(NullPublisher));
        let out = c.run("p").await.unwrap();
        assert_eq!(out.ques_count, 2);
    }

    #[tokio::test]
    async fn missing_ques_count_inferred_from_keys() {
        let transport = Arc::new(ScriptedTransport::text(
            r#"{"title": "t", "ques1": "a", "ques3": "c"}"#,
        ));
        let mut c = coordinator(transport, Arc::new(NullPublisher));
        let out = c.run("p").await.unwrap();
        assert_eq!(out.ques_count, 3, "inferred from the highest quesN key");
    }

    #[tokio::test]
    async fn split_ques_key_glitch_repaired() {
        let transport = Arc::new(ScriptedTransport::text(
            r#"{"title": "t", "qu es2": "b", "ques1": "a"}"#,
        ));
        let mut c = coordinator(transport, Arc::new(NullPublisher));
        let out = c.run("p").await.unwrap();
        assert_eq!(out.ques_count, 2);
        assert!(out.questions.contains_key("ques2"));
    }

    #[tokio::test]
    async fn unparseable_output_is_fatal() {
        let transport = Arc::new(ScriptedTransport::text("I cannot answer in JSON, sorry."));
        let mut c = coordinator(transport, Arc::new(NullPublisher));
        let err = c.run("p").await.unwrap_err();
        assert!(err.to_string().contains("unparseable"));
    }

    #[tokio::test]
    async fn output_without_any_question_keys_is_fatal() {
        let transport = Arc::new(ScriptedTransport::text(r#"{"title": "t"}"#));
        let mut c = coordinator(transport, Arc::new(NullPublisher));
        assert!(c.run("p").await.is_err());
    }

    #[tokio::test]
    async fn structured_panel_payload_published() {
        let publisher = Arc::new(MemoryPublisher::new());
        let transport = Arc::new(ScriptedTransport::text(GOOD_JSON));
        let mut c = coordinator(transport, publisher.clone());
        c.run("p").await.unwrap();
        let snap = publisher.snapshot().await;
        assert!(snap.iter().any(|(_, p)| matches!(
            &p.kind,
            PayloadKind::Agent { agent: AgentKind::Coordinator, json: Some(j), .. }
                if j["ques_count"] == 2
        )));
    }
}
