// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The coder agent: a retry-bounded control loop that forces actual code
//! execution.
//!
//! LLMs love to narrate instead of running code, to wrap arguments in
//! malformed JSON, and to hand over prose where Python was required.  The
//! loop here forces a tool call until one execution has succeeded, parses
//! arguments through a four-strategy fallback, rejects non-Python payloads
//! before they reach the interpreter, and converts interpreter errors into
//! reflection prompts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;

use anyhow::bail;
use regex::Regex;
use tracing::{info, warn};

use mma_channel::{MessagePayload, Publisher};
use mma_config::{BehaviorConfig, LimitsConfig};
use mma_interp::{execute_code_tool, CodeInterpreter, Execution};
use mma_model::{AssistantTurn, ChatOptions, LlmClient, Message, ToolCall, ToolChoice};
use mma_text::{json_fix, sanitize};

use crate::agent::AgentCore;
use crate::prompts;

fn code_field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?s)"code"\s*:\s*"(?P<code>.*?)""#).unwrap())
}

fn py_hint_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(import|from|def|class|for|while|if|elif|else|try|except|with|return|print)\b|plt\.|np\.|pd\.|fit\(|read_csv\(|range\(|open\(",
        )
        .unwrap()
    })
}

/// Result of one coder subtask.
#[derive(Debug, Clone)]
pub struct CoderOutcome {
    pub coder_response: String,
    /// Relative figure paths created during this subtask.
    pub created_images: Vec<String>,
}

pub struct CoderAgent {
    core: AgentCore,
    interpreter: Arc<dyn CodeInterpreter>,
    work_dir: PathBuf,
    max_retries: u32,
    force_tool_on_first_try: bool,
    light_cleaning: bool,
    is_first_run: bool,
}

impl CoderAgent {
    pub fn new(
        client: Arc<LlmClient>,
        publisher: Arc<dyn Publisher>,
        interpreter: Arc<dyn CodeInterpreter>,
        work_dir: impl Into<PathBuf>,
        limits: &LimitsConfig,
        behavior: &BehaviorConfig,
    ) -> Self {
        Self {
            core: AgentCore::new(client, publisher, limits),
            interpreter,
            work_dir: work_dir.into(),
            max_retries: limits.max_retries,
            force_tool_on_first_try: behavior.force_tool_on_first_try,
            light_cleaning: behavior.light_cleaning,
            is_first_run: true,
        }
    }

    pub fn history(&self) -> &[Message] {
        self.core.history()
    }

    /// Drive one subtask to completion.
    pub async fn run(&mut self, prompt: &str, subtask_title: &str) -> anyhow::Result<CoderOutcome> {
        info!(subtask = subtask_title, "coder subtask started");
        self.interpreter.add_section(subtask_title).await?;

        let mut retry_count = 0u32;
        let mut last_error = String::new();
        let mut executed_successfully = false;

        if self.is_first_run {
            self.is_first_run = false;
            self.core.init_system(prompts::CODER_PROMPT).await;
            let files_info = dataset_listing(&self.work_dir);
            let merged = format!("{files_info}\n\n{subtask_title}:\n{prompt}");
            self.core.append(Message::user(merged)).await;
        } else {
            self.core.append(Message::user(prompt)).await;
        }

        if self.core.turn_counter() >= self.core.max_chat_turns() {
            self.publish(MessagePayload::error("chat turn budget exhausted")).await;
            bail!("chat turn budget exhausted before subtask {subtask_title}");
        }

        while retry_count < self.max_retries && self.core.begin_turn() {
            let tool_choice = if self.force_tool_on_first_try && !executed_successfully {
                ToolChoice::Required("execute_code".into())
            } else {
                ToolChoice::Auto
            };
            let opts = ChatOptions {
                tools: vec![execute_code_tool()],
                tool_choice: Some(tool_choice),
                sub_title: Some(subtask_title.to_string()),
                ..ChatOptions::default()
            };
            let turn = self.core.chat(&opts).await?;

            let content = self.clean_assistant_text(&turn);

            if turn.has_tool_calls() {
                let calls = turn.tool_calls.clone().unwrap_or_default();
                let mut assistant = Message::assistant_with_tool_calls("", calls.clone());
                if !content.trim().is_empty() {
                    assistant.content = content.clone();
                }
                self.core.append(assistant).await;

                let Some(call) = calls.iter().find(|tc| tc.function.name == "execute_code") else {
                    warn!(
                        count = calls.len(),
                        "no execute_code call among tool calls, skipping"
                    );
                    let first = &calls[0];
                    self.append_tool_reply(first, "No runnable execute_code call detected; nothing was executed.")
                        .await;
                    retry_count += 1;
                    last_error = "no execute_code call".into();
                    continue;
                };

                let raw_code = extract_code(Some(&call.function.arguments), &content).await;

                if raw_code.trim().is_empty() {
                    warn!("empty code argument, skipping execution");
                    self.publish(MessagePayload::warning("subtask skipped: empty code argument")).await;
                    self.append_tool_reply(
                        call,
                        "Argument validation failed: `arguments.code` is missing or empty. \
                         Call again with strict JSON: {\"code\": \"<python only>\"}",
                    )
                    .await;
                    self.core.append(Message::user(prompts::DEMAND_STRICT_ARGUMENTS)).await;
                    retry_count += 1;
                    last_error = "empty code argument".into();
                    continue;
                }

                if !looks_like_python(&raw_code) {
                    warn!("extracted payload does not look like python, blocked");
                    self.append_tool_reply(
                        call,
                        "No executable Python detected: the payload looks like JSON, Markdown, \
                         or report text, so it was not executed. Call execute_code again with \
                         plain Python code only.",
                    )
                    .await;
                    self.core.append(Message::user(prompts::DEMAND_PYTHON_CODE)).await;
                    retry_count += 1;
                    last_error = "non-Python payload blocked".into();
                    continue;
                }

                let code = self.clean_code(&raw_code);
                self.publish(MessagePayload::interpreter_input(code.clone())).await;

                let execution = match self.interpreter.execute_code(&code).await {
                    Ok(e) => e,
                    Err(e) => Execution::err(format!("interpreter invocation failed: {e}")),
                };

                if execution.error_occurred {
                    let error_message = if execution.error_message.is_empty() {
                        "(execution error)".to_string()
                    } else {
                        execution.error_message.clone()
                    };
                    warn!(error = %error_message, "code execution failed");
                    self.append_tool_reply(call, &error_message).await;
                    self.publish(MessagePayload::error("coder reflecting on execution error")).await;
                    self.core
                        .append(Message::user(prompts::reflection_prompt(&error_message, &code)))
                        .await;
                    retry_count += 1;
                    last_error = error_message;
                } else {
                    self.append_tool_reply(call, &execution.output_text()).await;
                    executed_successfully = true;
                }
                continue;
            }

            // ── No tool calls ────────────────────────────────────────────────
            let content = if content.trim().is_empty() {
                "(assistant returned empty content - continuing)".to_string()
            } else {
                content
            };
            self.core.append(Message::assistant(content.clone())).await;

            if executed_successfully {
                // A successful execution exists and the model stopped calling
                // tools: this turn is the task summary.
                info!(subtask = subtask_title, "coder subtask finished");
                return Ok(CoderOutcome {
                    coder_response: content,
                    created_images: self.interpreter.get_created_images(subtask_title).await?,
                });
            }

            // Recovery: the model may have pasted the code into its text.
            let fallback_code = code_from_content(&content).await;
            if !fallback_code.trim().is_empty() && looks_like_python(&fallback_code) {
                let code = self.clean_code(&fallback_code);
                self.publish(MessagePayload::interpreter_input(code.clone())).await;
                info!("recovered code from assistant text, executing directly");
                let execution = match self.interpreter.execute_code(&code).await {
                    Ok(e) => e,
                    Err(e) => Execution::err(format!("interpreter invocation failed: {e}")),
                };
                // Results are recorded as assistant text: there is no paired
                // tool call, so a tool message would be an orphan.
                if execution.error_occurred {
                    let error_message = if execution.error_message.is_empty() {
                        "(execution error)".to_string()
                    } else {
                        execution.error_message.clone()
                    };
                    self.core
                        .append(Message::assistant(format!("[execution failed] {error_message}")))
                        .await;
                    self.publish(MessagePayload::error("coder reflecting on execution error")).await;
                    self.core
                        .append(Message::user(prompts::reflection_prompt(&error_message, &code)))
                        .await;
                    retry_count += 1;
                    last_error = error_message;
                } else {
                    self.core.append(Message::assistant(execution.output_text())).await;
                    executed_successfully = true;
                }
                continue;
            }

            // Nothing recoverable: demand a real tool call.
            self.publish(MessagePayload::info(format!(
                "coder has not run any code yet; requesting an execute_code call for {subtask_title}"
            )))
            .await;
            self.core.append(Message::user(prompts::DEMAND_TOOL_CALL)).await;
            retry_count += 1;
            last_error = "model did not execute code".into();

            if retry_count >= self.max_retries {
                self.publish(MessagePayload::error(
                    "model refused to execute code; retry budget exhausted",
                ))
                .await;
                bail!("model refused to execute code after {} attempts", self.max_retries);
            }
        }

        if retry_count >= self.max_retries {
            self.publish(MessagePayload::error("coder retry budget exhausted")).await;
            bail!(
                "failed to complete subtask {subtask_title} after {} attempts; last error: {last_error}",
                self.max_retries
            );
        }
        self.publish(MessagePayload::error("chat turn budget exhausted")).await;
        bail!(
            "reached the chat turn budget ({}) with subtask {subtask_title} incomplete; last error: {last_error}",
            self.core.max_chat_turns()
        );
    }

    fn clean_assistant_text(&self, turn: &AssistantTurn) -> String {
        if !self.light_cleaning {
            return turn.content.clone();
        }
        let s = sanitize::clean_control_chars(&turn.content, true);
        let s = sanitize::normalize_common_glitches(&s);
        sanitize::strip_fences_outer_or_all(&s)
    }

    fn clean_code(&self, raw: &str) -> String {
        if !self.light_cleaning {
            return raw.to_string();
        }
        sanitize::clean_control_chars(&sanitize::strip_fences_outer_or_all(raw), true)
    }

    async fn append_tool_reply(&mut self, call: &ToolCall, content: &str) {
        self.core
            .append(Message::tool_result(&call.id, &call.function.name, content))
            .await;
    }

    async fn publish(&self, payload: MessagePayload) {
        let task_id = self.core.task_id().to_string();
        if let Err(e) = self.core.publisher().publish(&task_id, payload).await {
            warn!("publish failed: {e}");
        }
    }
}

/// List the files sitting in the work dir root, for the first-run prompt.
fn dataset_listing(work_dir: &Path) -> String {
    let mut names: Vec<String> = std::fs::read_dir(work_dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.path().is_file())
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    if names.is_empty() {
        "The working directory contains no dataset files.".to_string()
    } else {
        format!("Dataset files in the working directory: {}", names.join(", "))
    }
}

// ─── Code extraction ──────────────────────────────────────────────────────────

/// Extract the `code` argument: tool arguments first, assistant text as a
/// fallback.
async fn extract_code(arguments: Option<&str>, fallback_text: &str) -> String {
    if let Some(args) = arguments {
        let code = code_from_arguments(args).await;
        if !code.trim().is_empty() {
            return sanitize::clean_control_chars(&sanitize::strip_fences_outer_or_all(&code), true);
        }
    }
    code_from_content(fallback_text).await
}

/// Four-strategy argument parsing, ordered by cost and strictness:
/// strict parse → (structured access is folded into the strict parse — the
/// normalizer JSON-encodes structured arguments) → JSON-fixer recovery →
/// regex field extraction with escape decoding.
async fn code_from_arguments(args: &str) -> String {
    let args = args.trim();
    if args.is_empty() {
        return String::new();
    }

    // 1) Strict parse of a JSON object argument string.
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(args) {
        if let Some(code) = value.get("code") {
            return code_value_to_string(code);
        }
    }

    // 2) Local JSON repair over the precleaned form.
    let precleaned = sanitize::clean_control_chars(&sanitize::preclean_tool_wrappers(args), true);
    let (obj, _stage) = json_fix::fix_and_parse(&precleaned, None).await;
    if let Some(map) = obj {
        if let Some(code) = map.get("code") {
            return code_value_to_string(code);
        }
    }

    // 3) Regex field extraction with escape decoding.
    if let Some(caps) = code_field_re().captures(&precleaned) {
        return decode_escaped_code(&caps["code"]);
    }

    String::new()
}

/// Recover code pasted into assistant text: a JSON object with a `code`
/// field, a quoted `"code": "..."` fragment, or a fenced/bare code block.
async fn code_from_content(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }

    let precleaned = sanitize::preclean_tool_wrappers(text);
    let blob = sanitize::extract_first_json_block(&precleaned, true);
    if !blob.is_empty() {
        let (obj, _stage) = json_fix::fix_and_parse(&blob, None).await;
        if let Some(map) = obj {
            if let Some(serde_json::Value::String(code)) = map.get("code") {
                if !code.trim().is_empty() {
                    return sanitize::clean_control_chars(
                        &sanitize::strip_fences_outer_or_all(code),
                        true,
                    );
                }
            }
        }
    }

    if let Some(caps) = code_field_re().captures(text) {
        let code = decode_escaped_code(&caps["code"]);
        return sanitize::clean_control_chars(&sanitize::strip_fences_outer_or_all(&code), true);
    }

    // Bare code: unwrap fences and accept if it smells like Python source.
    let unfenced = sanitize::strip_fences_outer_or_all(&precleaned);
    let markers = ["# %%", "import ", "from ", "plt.", "pd.read_", "np.", "def ", "class "];
    if !unfenced.is_empty() && markers.iter().any(|m| unfenced.contains(m)) {
        return sanitize::clean_control_chars(&unfenced, true);
    }

    String::new()
}

fn code_value_to_string(code: &serde_json::Value) -> String {
    match code {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Decode a regex-extracted `code` payload that still carries JSON-style
/// escapes (`\n`, `\t`, `\uXXXX`).
fn decode_escaped_code(raw: &str) -> String {
    let repaired = sanitize::fix_invalid_json_escapes(raw);
    if let Ok(decoded) = serde_json::from_str::<String>(&format!("\"{repaired}\"")) {
        return decoded;
    }
    raw.replace("\\r\\n", "\n").replace("\\n", "\n").replace("\\t", "\t")
}

/// Coarse Python-likeness gate run before anything reaches the interpreter.
/// JSON/Markdown payloads start with `{`/`[`; real code matches a keyword or
/// library-call pattern, or at least a weak structural signal.
pub(crate) fn looks_like_python(code: &str) -> bool {
    let snippet = sanitize::strip_fences_outer_or_all(code);
    let snippet = snippet.trim();
    if snippet.is_empty() {
        return false;
    }
    if snippet.starts_with('{') || snippet.starts_with('[') {
        return false;
    }
    if py_hint_re().is_match(snippet) {
        return true;
    }
    [":\n", ":\r", "=\n", "=\r", "():", ".plot(", ".read_csv("]
        .iter()
        .any(|sig| snippet.contains(sig))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
