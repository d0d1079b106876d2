// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tracing::{debug, info};

use mma_channel::Publisher;
use mma_config::LimitsConfig;
use mma_model::{
    governor, normalize, AssistantTurn, ChatOptions, LlmClient, LlmError, Message, Role,
};

use crate::compact;

/// Shared conversation core carried by every agent: the history, its append
/// hygiene, turn accounting, and the soft-limit compaction trigger.
pub struct AgentCore {
    client: Arc<LlmClient>,
    publisher: Arc<dyn Publisher>,
    history: Vec<Message>,
    turn_counter: u32,
    max_chat_turns: u32,
    max_memory: usize,
    soft_token_limit: usize,
    hard_token_limit: usize,
    initialized: bool,
}

impl AgentCore {
    pub fn new(
        client: Arc<LlmClient>,
        publisher: Arc<dyn Publisher>,
        limits: &LimitsConfig,
    ) -> Self {
        Self {
            client,
            publisher,
            history: Vec::new(),
            turn_counter: 0,
            max_chat_turns: limits.max_chat_turns,
            max_memory: limits.max_memory,
            soft_token_limit: limits.soft_token_limit,
            hard_token_limit: limits.hard_token_limit,
            initialized: false,
        }
    }

    pub fn client(&self) -> &Arc<LlmClient> {
        &self.client
    }

    pub fn publisher(&self) -> &Arc<dyn Publisher> {
        &self.publisher
    }

    pub fn task_id(&self) -> &str {
        self.client.task_id()
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn turn_counter(&self) -> u32 {
        self.turn_counter
    }

    pub fn max_chat_turns(&self) -> u32 {
        self.max_chat_turns
    }

    /// Count one model turn; returns false when the turn budget is spent.
    pub fn begin_turn(&mut self) -> bool {
        if self.turn_counter >= self.max_chat_turns {
            return false;
        }
        self.turn_counter += 1;
        true
    }

    /// Inject the system prompt exactly once, on first use.
    pub async fn init_system(&mut self, system_prompt: &str) {
        if !self.initialized {
            self.initialized = true;
            self.append(Message::system(system_prompt)).await;
        }
    }

    /// History append pipeline: sanitize content, substitute empty tool
    /// content, merge adjacent user turns, re-establish the
    /// first-after-system invariant, then check the memory budget.
    /// Tool appends skip compaction — a tool result must never be separated
    /// from its call mid-exchange.
    pub async fn append(&mut self, mut msg: Message) {
        msg.content = normalize::sanitize_for_history(&msg.content);
        if msg.role == Role::Tool && msg.content.trim().is_empty() {
            msg.content = normalize::EMPTY_TOOL_CONTENT.to_string();
        }
        let is_tool = msg.role == Role::Tool;

        normalize::push_merging_adjacent_user(&mut self.history, msg);
        governor::ensure_first_after_system_user(&mut self.history);

        if is_tool {
            debug!("tool append, compaction check skipped");
            return;
        }

        let total = governor::history_tokens(self.client.model(), &self.history);
        if total > self.soft_token_limit {
            info!(total, soft_limit = self.soft_token_limit, "soft token limit exceeded, compacting");
            self.compact().await;
        } else if self.history.len() > self.max_memory {
            info!(
                len = self.history.len(),
                max_memory = self.max_memory,
                "message count bound exceeded, compacting"
            );
            self.compact().await;
        }
    }

    async fn compact(&mut self) {
        compact::compact_history(&self.client, &mut self.history, self.hard_token_limit).await;
    }

    /// Chat against the current history.
    pub async fn chat(&self, opts: &ChatOptions) -> Result<AssistantTurn, LlmError> {
        self.client.chat(&self.history, opts).await
    }

    /// Default single-turn run: inject system on first call, append the user
    /// prompt, call the model, append and return the assistant text.
    pub async fn run(
        &mut self,
        prompt: &str,
        system_prompt: &str,
        sub_title: Option<&str>,
    ) -> anyhow::Result<String> {
        self.init_system(system_prompt).await;
        self.append(Message::user(prompt)).await;

        let opts = ChatOptions {
            sub_title: sub_title.map(str::to_string),
            ..ChatOptions::default()
        };
        let turn = self.chat(&opts).await?;
        let content = normalize::sanitize_for_history(&turn.content);
        self.append(Message::assistant(content.clone())).await;
        Ok(content)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
