// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Pub/sub payload envelope and the [`Publisher`] seam.
//!
//! The concrete transport (Redis, WebSocket fan-out) lives outside this
//! workspace; the core only needs a channel-addressed `publish` with
//! JSON-safe payloads.  Channels are task ids, one per workflow run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use mma_config::AgentKind;

/// Severity of a system notice shown in the task timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
    Success,
}

/// Typed payload body; the `msg_type` tag matches the wire contract
/// (`system | agent | user | tool`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "lowercase")]
pub enum PayloadKind {
    /// Pipeline progress and error notices.
    System { level: NoticeLevel, content: String },
    /// An agent's assistant text, optionally with the parsed structured
    /// object for panel consumers (coordinator / modeler output).
    Agent {
        agent: AgentKind,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        json: Option<Value>,
    },
    /// Echo of user-originated input.
    User { content: String },
    /// Tool input about to run (e.g. code handed to the interpreter).
    Tool { agent: AgentKind, input: Value },
}

/// Envelope published on a task channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: PayloadKind,
}

impl MessagePayload {
    fn new(kind: PayloadKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn system(level: NoticeLevel, content: impl Into<String>) -> Self {
        Self::new(PayloadKind::System { level, content: content.into() })
    }

    pub fn info(content: impl Into<String>) -> Self {
        Self::system(NoticeLevel::Info, content)
    }

    pub fn warning(content: impl Into<String>) -> Self {
        Self::system(NoticeLevel::Warning, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::system(NoticeLevel::Error, content)
    }

    pub fn success(content: impl Into<String>) -> Self {
        Self::system(NoticeLevel::Success, content)
    }

    pub fn agent_text(agent: AgentKind, content: impl Into<String>) -> Self {
        Self::new(PayloadKind::Agent { agent, content: content.into(), json: None })
    }

    /// Structured panel payload — the parsed JSON object rides alongside its
    /// serialized form.
    pub fn agent_json(agent: AgentKind, json: Value) -> Self {
        let content = json.to_string();
        Self::new(PayloadKind::Agent { agent, content, json: Some(json) })
    }

    pub fn interpreter_input(code: impl Into<String>) -> Self {
        Self::new(PayloadKind::Tool {
            agent: AgentKind::Coder,
            input: serde_json::json!({ "code": code.into() }),
        })
    }
}

/// Outbound side of the transport.  `channel` is the task id.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: MessagePayload) -> anyhow::Result<()>;
}

/// Publisher that drops everything.  Default for headless runs and tests
/// that do not assert on published traffic.
#[derive(Debug, Default)]
pub struct NullPublisher;

#[async_trait]
impl Publisher for NullPublisher {
    async fn publish(&self, _channel: &str, _payload: MessagePayload) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Buffering publisher for tests: records every payload with its channel.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    messages: Mutex<Vec<(String, MessagePayload)>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<(String, MessagePayload)> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, channel: &str, payload: MessagePayload) -> anyhow::Result<()> {
        self.messages.lock().await.push((channel.to_string(), payload));
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
