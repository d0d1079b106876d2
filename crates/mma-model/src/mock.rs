// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scripted chat transport for tests: plays back a queue of canned results
//! and records every request it sees.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::client::ChatTransport;
use crate::error::LlmError;
use crate::{ChatRequest, ChatResponse};

/// One scripted step: a full response value or an error to surface.
pub enum ScriptedStep {
    Text(String),
    ToolCall { id: String, name: String, arguments: String },
    Raw(serde_json::Value),
    Fail(fn() -> LlmError),
}

/// Plays back scripted steps in order; repeats the last step when the
/// script runs dry.  Records request bodies for assertions.
pub struct ScriptedTransport {
    steps: Mutex<Vec<ScriptedStep>>,
    requests: Mutex<Vec<serde_json::Value>>,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self { steps: Mutex::new(steps), requests: Mutex::new(Vec::new()) }
    }

    pub fn text(reply: impl Into<String>) -> Self {
        Self::new(vec![ScriptedStep::Text(reply.into())])
    }

    /// Request bodies seen so far, as serialized JSON values.
    pub fn requests(&self) -> Vec<serde_json::Value> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next_step(&self) -> ScriptedStep {
        let mut steps = self.steps.lock().unwrap();
        if steps.len() > 1 {
            steps.remove(0)
        } else {
            match steps.first() {
                Some(ScriptedStep::Text(t)) => ScriptedStep::Text(t.clone()),
                Some(ScriptedStep::ToolCall { id, name, arguments }) => ScriptedStep::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                },
                Some(ScriptedStep::Raw(v)) => ScriptedStep::Raw(v.clone()),
                Some(ScriptedStep::Fail(f)) => ScriptedStep::Fail(*f),
                None => ScriptedStep::Text(String::new()),
            }
        }
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.requests
            .lock()
            .unwrap()
            .push(serde_json::to_value(request).expect("request serializes"));

        let body = match self.next_step() {
            ScriptedStep::Text(text) => json!({
                "choices": [{ "message": { "role": "assistant", "content": text } }]
            }),
            ScriptedStep::ToolCall { id, name, arguments } => json!({
                "choices": [{ "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": id,
                        "type": "function",
                        "function": { "name": name, "arguments": arguments },
                    }],
                } }]
            }),
            ScriptedStep::Raw(v) => v,
            ScriptedStep::Fail(make) => return Err(make()),
        };

        serde_json::from_value(body).map_err(|e| LlmError::MalformedResponse(e.to_string()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
