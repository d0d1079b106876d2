// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The writer agent: section drafting with a bounded image-reference
//! correction loop.
//!
//! Drafts may only reference images from the per-section availability list,
//! each at most once.  Violations are fed back as correction prompts; when
//! the attempt budget runs out, invalid references are replaced with a
//! placeholder so a bad draft can never smuggle broken paths into the final
//! document.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use mma_channel::{MessagePayload, Publisher};
use mma_config::{FormatOutput, LimitsConfig};
use mma_model::{ChatOptions, LlmClient, Message};
use mma_text::sanitize;

use crate::agent::AgentCore;
use crate::prompts;

pub struct WriterAgent {
    core: AgentCore,
    format_output: FormatOutput,
    max_fix_attempts: u32,
    available_images: Vec<String>,
}

impl WriterAgent {
    pub fn new(
        client: Arc<LlmClient>,
        publisher: Arc<dyn Publisher>,
        limits: &LimitsConfig,
        format_output: FormatOutput,
    ) -> Self {
        Self {
            core: AgentCore::new(client, publisher, limits),
            format_output,
            max_fix_attempts: limits.writer_max_fix_attempts,
            available_images: Vec::new(),
        }
    }

    pub fn history(&self) -> &[Message] {
        self.core.history()
    }

    /// Draft one section.  `available_images` is the already-filtered list
    /// for this section; the returned text has passed reference validation
    /// or been degraded to placeholders.
    pub async fn run(
        &mut self,
        prompt: &str,
        available_images: Vec<String>,
        sub_title: &str,
    ) -> anyhow::Result<String> {
        info!(section = sub_title, images = available_images.len(), "writer section started");
        self.core
            .init_system(&prompts::writer_system_prompt(self.format_output))
            .await;

        self.available_images = available_images;
        let mut prompt = prompt.to_string();
        if !self.available_images.is_empty() {
            prompt.push_str(&prompts::image_policy_prompt(&self.available_images));
        }
        self.core.append(Message::user(prompt)).await;

        // The writer exposes no tools; tool history (none) flattens away.
        let opts = ChatOptions {
            sub_title: Some(sub_title.to_string()),
            ..ChatOptions::default()
        };
        let turn = self.core.chat(&opts).await?;
        let mut content = turn.content;
        self.core.append(Message::assistant(content.clone())).await;

        let mut attempt = 0u32;
        loop {
            let refs = sanitize::extract_markdown_image_paths(&content);
            let (invalid, duplicates) = self.validate_image_paths(&refs);
            if invalid.is_empty() && duplicates.is_empty() {
                break;
            }
            if attempt >= self.max_fix_attempts {
                warn!(
                    section = sub_title,
                    invalid = invalid.len(),
                    duplicates = duplicates.len(),
                    "image violations persist after correction budget, degrading to placeholders"
                );
                content = replace_invalid_references(&content, &invalid);
                break;
            }
            attempt += 1;
            warn!(
                section = sub_title,
                attempt,
                invalid = ?invalid,
                duplicates = ?duplicates,
                "image reference violations, requesting correction"
            );
            self.publish(MessagePayload::warning(format!(
                "writer draft for {sub_title} has image reference violations (attempt {attempt}/{})",
                self.max_fix_attempts
            )))
            .await;

            let correction =
                prompts::image_correction_prompt(&invalid, &duplicates, &self.available_images);
            self.core.append(Message::user(correction)).await;
            let fix_turn = self
                .core
                .chat(&ChatOptions { sub_title: Some(sub_title.to_string()), ..ChatOptions::default() })
                .await?;
            content = fix_turn.content;
            self.core.append(Message::assistant(content.clone())).await;
        }

        info!(section = sub_title, "writer section finished");
        Ok(content)
    }

    /// Split references into invalid (unknown path or forbidden prefix) and
    /// duplicated (appears more than once).
    fn validate_image_paths(&self, refs: &[String]) -> (Vec<String>, Vec<String>) {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut order: Vec<&str> = Vec::new();
        for p in refs {
            let count = counts.entry(p.as_str()).or_insert(0);
            if *count == 0 {
                order.push(p.as_str());
            }
            *count += 1;
        }

        let mut invalid = Vec::new();
        let mut duplicates = Vec::new();
        for p in order {
            if counts[p] > 1 {
                duplicates.push(p.to_string());
            }
            let known = self.available_images.iter().any(|a| a == p);
            if !known || !sanitize::is_allowed_image_prefix(p) {
                invalid.push(p.to_string());
            }
        }
        (invalid, duplicates)
    }

    async fn publish(&self, payload: MessagePayload) {
        let task_id = self.core.task_id().to_string();
        if let Err(e) = self.core.publisher().publish(&task_id, payload).await {
            warn!("publish failed: {e}");
        }
    }
}

/// Replace every reference to an invalid path with a visible placeholder.
fn replace_invalid_references(text: &str, invalid: &[String]) -> String {
    let mut out = text.to_string();
    for path in invalid {
        let image_ref_open = format!("]({path})");
        out = out.replace(&image_ref_open, "](figure-unavailable)");
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mma_channel::NullPublisher;
    use mma_config::{AgentKind, BehaviorConfig, LlmConfig};
    use mma_model::mock::ScriptedStep;
    use mma_model::ScriptedTransport;

    fn writer_with(transport: Arc<ScriptedTransport>, max_fix_attempts: u32) -> WriterAgent {
        let limits = LimitsConfig { writer_max_fix_attempts: max_fix_attempts, ..LimitsConfig::default() };
        let client = Arc::new(LlmClient::new(
            "task-1",
            AgentKind::Writer,
            &LlmConfig { model: "test-model".into(), ..LlmConfig::default() },
            &limits,
            &BehaviorConfig::default(),
            transport,
            Arc::new(NullPublisher),
        ));
        WriterAgent::new(client, Arc::new(NullPublisher), &limits, FormatOutput::Markdown)
    }

    fn eda_images() -> Vec<String> {
        vec!["eda/figures/fig_a.png".to_string(), "eda/figures/fig_b.png".to_string()]
    }

    #[tokio::test]
    async fn clean_draft_returned_unchanged() {
        let draft = "## EDA\n\nDistribution shown below.\n\n![hist](eda/figures/fig_a.png)\n";
        let transport = Arc::new(ScriptedTransport::text(draft));
        let mut w = writer_with(transport.clone(), 5);
        let out = w.run("write the EDA section", eda_images(), "eda").await.unwrap();
        assert_eq!(out, draft);
        assert_eq!(transport.request_count(), 1, "no correction round needed");
    }

    #[tokio::test]
    async fn image_policy_injected_into_prompt() {
        let transport = Arc::new(ScriptedTransport::text("no images used"));
        let mut w = writer_with(transport.clone(), 5);
        w.run("write", eda_images(), "eda").await.unwrap();
        let user = transport.requests()[0]["messages"][1]["content"].as_str().unwrap().to_string();
        assert!(user.contains("eda/figures/fig_a.png"));
        assert!(user.contains("at most once"));
    }

    #[tokio::test]
    async fn writer_requests_carry_no_tools() {
        let transport = Arc::new(ScriptedTransport::text("text"));
        let mut w = writer_with(transport.clone(), 5);
        w.run("write", vec![], "firstPage").await.unwrap();
        assert!(transport.requests()[0].get("tools").is_none());
    }

    #[tokio::test]
    async fn invalid_reference_corrected_in_second_round() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptedStep::Text("![x](made/up/path.png)".into()),
            ScriptedStep::Text("![x](eda/figures/fig_a.png)".into()),
        ]));
        let mut w = writer_with(transport.clone(), 5);
        let out = w.run("write", eda_images(), "eda").await.unwrap();
        assert_eq!(out, "![x](eda/figures/fig_a.png)");
        assert_eq!(transport.request_count(), 2);

        // The correction prompt named the offending path.
        let correction = transport.requests()[1]["messages"].as_array().unwrap().last().unwrap()["content"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(correction.contains("made/up/path.png"));
    }

    #[tokio::test]
    async fn duplicate_reference_detected() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptedStep::Text(
                "![a](eda/figures/fig_a.png)\ntext\n![b](eda/figures/fig_a.png)".into(),
            ),
            ScriptedStep::Text("![a](eda/figures/fig_a.png)".into()),
        ]));
        let mut w = writer_with(transport.clone(), 5);
        let out = w.run("write", eda_images(), "eda").await.unwrap();
        assert_eq!(out, "![a](eda/figures/fig_a.png)");
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_attempts_degrade_to_placeholder() {
        // The model never fixes the reference; after the budget, the invalid
        // path is replaced rather than returned verbatim.
        let transport = Arc::new(ScriptedTransport::text("![x](bogus/path.png) rest of text"));
        let mut w = writer_with(transport.clone(), 2);
        let out = w.run("write", eda_images(), "eda").await.unwrap();
        assert!(!out.contains("bogus/path.png"));
        assert!(out.contains("figure-unavailable"));
        assert!(out.contains("rest of text"));
        // initial draft + 2 correction attempts.
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test]
    async fn listed_image_with_forbidden_prefix_is_invalid() {
        // Even if a path sneaks into the availability list, a prefix outside
        // the section figure directories is rejected.
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptedStep::Text("![x](notes/fig.png)".into()),
            ScriptedStep::Text("clean".into()),
        ]));
        let mut w = writer_with(transport.clone(), 5);
        let out = w.run("write", vec!["notes/fig.png".to_string()], "eda").await.unwrap();
        assert_eq!(out, "clean");
    }

    #[test]
    fn replace_invalid_references_touches_only_listed_paths() {
        let text = "![a](bad.png) and ![b](eda/figures/good.png)";
        let out = replace_invalid_references(text, &["bad.png".to_string()]);
        assert!(out.contains("](figure-unavailable)"));
        assert!(out.contains("eda/figures/good.png"));
    }
}
