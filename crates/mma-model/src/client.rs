// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat client.
//!
//! Every call runs the pre-flight pipeline (pairing repair, hard-limit
//! truncation, first-after-system enforcement, wire sanitizing, capability
//! flatten, strict audit) before the request leaves the process, then
//! retries transient wire errors with exponential backoff.  Successful
//! assistant turns are routed to the task channel according to the agent
//! kind.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use mma_channel::{MessagePayload, Publisher};
use mma_config::{AgentKind, BehaviorConfig, LimitsConfig, LlmConfig};
use mma_text::json_fix::{self, JsonRebuild};

use crate::error::LlmError;
use crate::{
    governor, normalize, pairing, wire, AssistantTurn, ChatRequest, ChatResponse, Message,
    ToolChoice, ToolSpec,
};

/// Default attempt budget for primary agent calls.
pub const PRIMARY_ATTEMPTS: u32 = 8;
/// Default attempt budget for auxiliary calls (summaries, JSON rebuilds).
pub const AUX_ATTEMPTS: u32 = 3;

const BACKOFF_BASE_SECS: f64 = 0.8;

/// The transport seam: one request in, one parsed response out.
/// [`HttpTransport`] is the production implementation; tests use
/// [`crate::ScriptedTransport`].
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;
}

/// Per-call options.
#[derive(Clone)]
pub struct ChatOptions {
    pub tools: Vec<ToolSpec>,
    pub tool_choice: Option<ToolChoice>,
    /// Subtask label attached to published messages (observability only).
    pub sub_title: Option<String>,
    /// Route the assistant turn to the task channel on success.
    pub publish: bool,
    pub top_p: Option<f32>,
    /// Override the retry budget; `None` uses [`PRIMARY_ATTEMPTS`].
    pub max_attempts: Option<u32>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            tool_choice: None,
            sub_title: None,
            publish: true,
            top_p: None,
            max_attempts: None,
        }
    }
}

impl ChatOptions {
    /// Options for auxiliary traffic: unpublished, short retry budget.
    pub fn auxiliary() -> Self {
        Self { publish: false, max_attempts: Some(AUX_ATTEMPTS), ..Self::default() }
    }
}

/// Chat client bound to one agent role within one workflow run.
pub struct LlmClient {
    task_id: String,
    kind: AgentKind,
    model: String,
    max_tokens: Option<u32>,
    top_p: Option<f32>,
    hard_token_limit: usize,
    supports_tool_role: bool,
    transport: Arc<dyn ChatTransport>,
    publisher: Arc<dyn Publisher>,
}

impl LlmClient {
    pub fn new(
        task_id: impl Into<String>,
        kind: AgentKind,
        cfg: &LlmConfig,
        limits: &LimitsConfig,
        behavior: &BehaviorConfig,
        transport: Arc<dyn ChatTransport>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            top_p: cfg.top_p,
            hard_token_limit: limits.hard_token_limit,
            supports_tool_role: behavior.supports_tool_role,
            transport,
            publisher,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Send one chat request built from `history` and return the normalized
    /// assistant turn.
    pub async fn chat(
        &self,
        history: &[Message],
        opts: &ChatOptions,
    ) -> Result<AssistantTurn, LlmError> {
        if let Some(sub_title) = &opts.sub_title {
            debug!(agent = %self.kind, %sub_title, "chat call");
        }
        let messages = self.prepare_history(history, !opts.tools.is_empty())?;

        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            tools: if opts.tools.is_empty() { None } else { Some(opts.tools.clone()) },
            tool_choice: opts.tool_choice.clone(),
            stream: false,
            max_tokens: self.max_tokens,
            top_p: opts.top_p.or(self.top_p),
        };

        let response = self.send_with_retry(&request, opts.max_attempts.unwrap_or(PRIMARY_ATTEMPTS)).await?;
        let turn = extract_turn(response)?;

        if opts.publish {
            self.publish_turn(&turn).await;
        }
        Ok(turn)
    }

    /// One-shot unpublished call over a fresh two-message history.  Used for
    /// compaction summaries and JSON rebuilds.
    pub async fn auxiliary_chat(
        &self,
        system_prompt: &str,
        user_content: &str,
    ) -> Result<String, LlmError> {
        let history = vec![Message::system(system_prompt), Message::user(user_content)];
        let turn = self.chat(&history, &ChatOptions::auxiliary()).await?;
        Ok(turn.content)
    }

    /// Pre-flight pipeline; the returned history satisfies I1–I5.
    fn prepare_history(
        &self,
        history: &[Message],
        has_tools: bool,
    ) -> Result<Vec<Message>, LlmError> {
        let mut h = history.to_vec();
        pairing::repair_tool_pairings(&mut h);
        h = governor::enforce_hard_limit(&self.model, h, self.hard_token_limit);
        governor::ensure_first_after_system_user(&mut h);
        let mut h = wire::sanitize_for_wire(h);

        // Backends without the tool role — or requests that carry no tools —
        // cannot be sent tool history.
        let tools_enabled = self.supports_tool_role && has_tools;
        if !tools_enabled {
            h = wire::sanitize_for_wire(wire::flatten_tool_history(h));
            governor::ensure_first_after_system_user(&mut h);
        }

        if let Err(violation) = wire::audit(&h, tools_enabled) {
            warn!(%violation, "pre-flight audit failed, flattening and retrying");
            h = wire::sanitize_for_wire(wire::flatten_tool_history(h));
            governor::ensure_first_after_system_user(&mut h);
            wire::audit(&h, false)?;
        }
        Ok(h)
    }

    async fn send_with_retry(
        &self,
        request: &ChatRequest,
        max_attempts: u32,
    ) -> Result<ChatResponse, LlmError> {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            match self.transport.send(request).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                    let jitter: f64 = rand::thread_rng().gen_range(0.0..0.3);
                    let delay = BACKOFF_BASE_SECS * 2f64.powi(attempt as i32) + jitter;
                    warn!(
                        agent = %self.kind,
                        attempt = attempt + 1,
                        max_attempts,
                        delay_secs = delay,
                        error = %e,
                        "transient chat error, backing off"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(LlmError::RetriesExhausted {
                        attempts: max_attempts,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Route the assistant turn to the task channel.  Strict-JSON agents
    /// publish parsed objects only; a tool-call-only turn has nothing to
    /// display until its tool result arrives, so it is suppressed.
    async fn publish_turn(&self, turn: &AssistantTurn) {
        if turn.content.trim().is_empty() && turn.has_tool_calls() {
            debug!(agent = %self.kind, "suppressing publication of tool-call-only turn");
            return;
        }
        let payload = match self.kind {
            AgentKind::Coordinator | AgentKind::Modeler => {
                let (obj, stage) = json_fix::fix_and_parse(&turn.content, None).await;
                match obj {
                    Some(map) => {
                        MessagePayload::agent_json(self.kind, serde_json::Value::Object(map))
                    }
                    None => MessagePayload::error(format!(
                        "{} produced unparseable JSON ({stage})",
                        self.kind
                    )),
                }
            }
            _ => {
                if turn.content.trim().is_empty() {
                    return;
                }
                MessagePayload::agent_text(self.kind, turn.content.clone())
            }
        };
        if let Err(e) = self.publisher.publish(&self.task_id, payload).await {
            warn!(agent = %self.kind, "publish failed: {e}");
        }
    }
}

/// The JSON fixer's rebuild stage rides on the same client, unpublished.
#[async_trait]
impl JsonRebuild for LlmClient {
    async fn rebuild_json(&self, system_prompt: &str, payload: &str) -> anyhow::Result<String> {
        Ok(self.auxiliary_chat(system_prompt, payload).await?)
    }
}

/// Normalize the first choice into an [`AssistantTurn`].
fn extract_turn(response: ChatResponse) -> Result<AssistantTurn, LlmError> {
    let choice = response.choices.into_iter().next().ok_or(LlmError::EmptyResponse)?;
    let msg = normalize::normalize_message(choice.message);
    Ok(AssistantTurn { content: msg.content, tool_calls: msg.tool_calls })
}

// ─── HTTP transport ───────────────────────────────────────────────────────────

/// Production transport for OpenAI-compatible `/chat/completions` endpoints.
pub struct HttpTransport {
    http: reqwest::Client,
    chat_url: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(cfg: &LlmConfig, limits: &LimitsConfig) -> anyhow::Result<Self> {
        let base = cfg
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1")
            .trim_end_matches('/');
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(limits.request_timeout_secs))
            .connect_timeout(Duration::from_secs(limits.connect_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            chat_url: format!("{base}/chat/completions"),
            api_key: cfg.resolve_api_key(),
        })
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let mut req = self.http.post(&self.chat_url).json(request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(classify_transport_error)?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }
        resp.json::<ChatResponse>()
            .await
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))
    }
}

fn classify_status(status: u16, body: String) -> LlmError {
    match status {
        429 => LlmError::RateLimit(body),
        400 => LlmError::BadRequest(body),
        401 | 403 => LlmError::Auth(body),
        404 => LlmError::NotFound(body),
        s if s >= 500 => LlmError::Server { status: s, body },
        s => LlmError::BadRequest(format!("unexpected status {s}: {body}")),
    }
}

fn classify_transport_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(e.to_string())
    } else {
        LlmError::Connection(e.to_string())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
