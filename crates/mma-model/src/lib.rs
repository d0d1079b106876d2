// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Conversation data model, history hygiene, and the OpenAI-compatible chat
//! client.
//!
//! Every request that leaves this crate satisfies the message-shape contract
//! of chat-completions APIs: first non-system message is a user turn, every
//! assistant tool-call has a matching tool result, no trailing tool message,
//! and no content-free turns.  The client's preflight pipeline repairs
//! histories that drift from that contract instead of sending them as-is.

pub mod client;
pub mod error;
pub mod governor;
pub mod mock;
pub mod normalize;
pub mod pairing;
mod types;
pub mod wire;

pub use client::{ChatOptions, ChatTransport, HttpTransport, LlmClient};
pub use error::{AuditError, LlmError};
pub use governor::{ensure_first_after_system_user, estimate_tokens, history_tokens, SUMMARY_MARKER};
pub use mock::ScriptedTransport;
pub use types::*;
