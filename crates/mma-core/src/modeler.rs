// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The modeler: a single-shot strict-JSON agent that turns the question
//! breakdown into a per-subtask modeling strategy.

use std::sync::Arc;

use anyhow::Context;
use serde_json::{Map, Value};
use tracing::info;

use mma_channel::Publisher;
use mma_config::LimitsConfig;
use mma_model::{ChatOptions, LlmClient, Message};
use mma_text::{json_fix, sanitize};

use crate::agent::AgentCore;
use crate::coordinator::CoordinatorOutput;
use crate::prompts;

/// Modeling strategies keyed by subtask (`eda`, `quesN`,
/// `sensitivity_analysis`).
#[derive(Debug, Clone)]
pub struct ModelerOutput {
    pub solutions: Map<String, Value>,
}

impl ModelerOutput {
    /// Strategy text for one subtask, if the modeler provided it.
    pub fn strategy(&self, key: &str) -> Option<&str> {
        self.solutions.get(key).and_then(Value::as_str)
    }
}

pub struct ModelerAgent {
    core: AgentCore,
}

impl ModelerAgent {
    pub fn new(client: Arc<LlmClient>, publisher: Arc<dyn Publisher>, limits: &LimitsConfig) -> Self {
        Self { core: AgentCore::new(client, publisher, limits) }
    }

    /// Produce the modeling strategy for every solution subtask.  The user
    /// turn is the JSON-encoded coordinator output; a parse failure is
    /// fatal for the workflow.
    pub async fn run(&mut self, coordination: &CoordinatorOutput) -> anyhow::Result<ModelerOutput> {
        self.core.init_system(prompts::MODELER_PROMPT).await;

        let questions_json = Value::Object(coordination.questions.clone()).to_string();
        self.core.append(Message::user(questions_json)).await;

        // The client publishes the parsed object as the modeler panel.
        let turn = self.core.chat(&ChatOptions::default()).await?;

        let cleaned = sanitize::normalize_common_glitches(&sanitize::clean_control_chars(
            &turn.content,
            true,
        ));
        self.core.append(Message::assistant(cleaned.clone())).await;

        let (obj, stage) = json_fix::fix_and_parse(&cleaned, None).await;
        let solutions = obj
            .with_context(|| format!("modeler returned unparseable JSON ({stage}): {cleaned}"))?;

        info!(subtasks = solutions.len(), "modeler produced strategies");
        Ok(ModelerOutput { solutions })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
