// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// A violated invariant found by the pre-flight audit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditError {
    #[error("first non-system message is {found}, expected user")]
    FirstAfterSystemNotUser { found: String },
    #[error("assistant tool call {id} at index {index} has no tool result before the next assistant turn")]
    UnansweredToolCall { index: usize, id: String },
    #[error("tool message at index {index} resolves to no preceding assistant tool call (id {id:?})")]
    OrphanToolMessage { index: usize, id: Option<String> },
    #[error("history ends with a tool message")]
    TrailingToolMessage,
    #[error("message at index {index} ({role}) has empty content and no tool calls")]
    EmptyContent { index: usize, role: String },
}

/// Error taxonomy of the chat client.
///
/// Transient variants are retried with exponential backoff; structural
/// variants fail fast.  Exhausting the retry budget surfaces the last
/// transient error wrapped in [`LlmError::RetriesExhausted`].
#[derive(Debug, Error)]
pub enum LlmError {
    // ── transient ────────────────────────────────────────────────────────────
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("malformed response body: {0}")]
    MalformedResponse(String),

    // ── structural, fail fast ────────────────────────────────────────────────
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("endpoint not found: {0}")]
    NotFound(String),
    #[error("history failed pre-flight audit: {0}")]
    Audit(#[from] AuditError),
    #[error("response contained no choices")]
    EmptyResponse,

    #[error("retry budget exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<LlmError>,
    },
}

impl LlmError {
    /// Whether the retry loop should take another attempt at this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimit(_)
                | LlmError::Timeout(_)
                | LlmError::Connection(_)
                | LlmError::Server { .. }
                | LlmError::MalformedResponse(_)
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
