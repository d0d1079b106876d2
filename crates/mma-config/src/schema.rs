// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

/// Which role an LLM endpoint (and its published messages) serves in the
/// pipeline.  Used for publish routing and per-agent endpoint selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Coordinator,
    Modeler,
    Coder,
    Writer,
    System,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentKind::Coordinator => write!(f, "coordinator"),
            AgentKind::Modeler => write!(f, "modeler"),
            AgentKind::Coder => write!(f, "coder"),
            AgentKind::Writer => write!(f, "writer"),
            AgentKind::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub behavior: BehaviorConfig,
    #[serde(default)]
    pub report: ReportConfig,
    /// Per-agent LLM endpoints.  Each role carries its own key / model /
    /// base URL so deployments can mix providers (e.g. a cheap model for the
    /// coordinator, a code-tuned model for the coder).
    #[serde(default)]
    pub coordinator: LlmConfig,
    #[serde(default)]
    pub modeler: LlmConfig,
    #[serde(default)]
    pub coder: LlmConfig,
    #[serde(default)]
    pub writer: LlmConfig,
}

impl Settings {
    /// The endpoint configured for `kind`.  `System` maps to the coordinator
    /// endpoint (auxiliary calls such as JSON rebuilds and summaries).
    pub fn llm_for(&self, kind: AgentKind) -> &LlmConfig {
        match kind {
            AgentKind::Coordinator | AgentKind::System => &self.coordinator,
            AgentKind::Modeler => &self.modeler,
            AgentKind::Coder => &self.coder,
            AgentKind::Writer => &self.writer,
        }
    }
}

/// Token, turn, and retry budgets for one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Token count at which history compaction triggers.
    #[serde(default = "default_soft_token_limit")]
    pub soft_token_limit: usize,
    /// Truncation ceiling applied to every outgoing request.
    #[serde(default = "default_hard_token_limit")]
    pub hard_token_limit: usize,
    /// Maximum LLM turns per agent before the run is declared incomplete.
    #[serde(default = "default_max_chat_turns")]
    pub max_chat_turns: u32,
    /// Consecutive-failure budget for the coder loop.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Message-count bound that triggers compaction even when the token
    /// estimate is under the soft limit.
    #[serde(default = "default_max_memory")]
    pub max_memory: usize,
    /// Bounded correction attempts for writer image-reference violations.
    #[serde(default = "default_writer_max_fix_attempts")]
    pub writer_max_fix_attempts: u32,
    /// Outer per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Socket connect timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_soft_token_limit() -> usize {
    100_000
}
fn default_hard_token_limit() -> usize {
    120_000
}
fn default_max_chat_turns() -> u32 {
    60
}
fn default_max_retries() -> u32 {
    5
}
fn default_max_memory() -> usize {
    100
}
fn default_writer_max_fix_attempts() -> u32 {
    5
}
fn default_request_timeout_secs() -> u64 {
    600
}
fn default_connect_timeout_secs() -> u64 {
    120
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            soft_token_limit: default_soft_token_limit(),
            hard_token_limit: default_hard_token_limit(),
            max_chat_turns: default_max_chat_turns(),
            max_retries: default_max_retries(),
            max_memory: default_max_memory(),
            writer_max_fix_attempts: default_writer_max_fix_attempts(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Feature toggles for JSON strictness, cleaning, and backend capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    /// Accept only strict JSON from the coordinator/modeler; when true the
    /// JSON fixer never falls back to an LLM rebuild.
    #[serde(default = "default_true")]
    pub strict_json_only: bool,
    /// Remove control characters and outer code fences from LLM text before
    /// it enters history or the interpreter.  Never rewrites semantics.
    #[serde(default = "default_true")]
    pub light_cleaning: bool,
    /// Force `tool_choice: execute_code` on coder turns until the first
    /// successful execution, so the model cannot narrate instead of running.
    #[serde(default = "default_true")]
    pub force_tool_on_first_try: bool,
    /// Whether the deployment's backend accepts the `tool` message role.
    /// When false, tool history is flattened into assistant text before send.
    #[serde(default = "default_true")]
    pub supports_tool_role: bool,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            strict_json_only: true,
            light_cleaning: true,
            force_tool_on_first_try: true,
            supports_tool_role: true,
        }
    }
}

/// Report template family used by the writer prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompTemplate {
    #[default]
    China,
    American,
}

/// Output markup of the final document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FormatOutput {
    #[default]
    Markdown,
    Latex,
}

impl std::fmt::Display for FormatOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormatOutput::Markdown => write!(f, "Markdown"),
            FormatOutput::Latex => write!(f, "LaTeX"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default)]
    pub comp_template: CompTemplate,
    #[serde(default)]
    pub format_output: FormatOutput,
}

/// One OpenAI-compatible chat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model name forwarded to the API.
    pub model: String,
    /// Explicit API key; prefer `api_key_env` in config files so secrets
    /// stay out of version control.
    pub api_key: Option<String>,
    /// Environment variable holding the API key (read at resolve time).
    pub api_key_env: Option<String>,
    /// API base ending before `/chat/completions`,
    /// e.g. `https://api.openai.com/v1`.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    /// Nucleus sampling override forwarded when set.
    pub top_p: Option<f32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".into(),
            api_key: None,
            api_key_env: None,
            base_url: None,
            max_tokens: None,
            top_p: None,
        }
    }
}

impl LlmConfig {
    /// Resolve the API key: explicit value first, then the named env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            return Some(k.clone());
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
