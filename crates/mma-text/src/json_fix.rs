// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Multi-stage JSON recovery: local parse → escape repair → optional LLM
//! rebuild → lenient fallback.
//!
//! The pipeline stops at the first stage that yields a JSON object.  Stage
//! tags are returned for observability only — callers never branch on them
//! except to log.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::sanitize;

/// System prompt for the LLM rebuild stage: one valid JSON object, nothing
/// else.
const REBUILD_SYSTEM_PROMPT: &str = "You are a strict JSON repair engine.\n\
Requirements:\n\
1) Output exactly one JSON object with no explanation or extra text.\n\
2) The output must be valid JSON (double quotes, correct escapes).\n\
3) The top-level value must be an object, never an array or multiple objects.";

/// Performs the single constrained LLM request used by the rebuild stage.
///
/// Implemented by the LLM client; `None` disables the stage entirely
/// (strict-mode callers).
#[async_trait]
pub trait JsonRebuild: Send + Sync {
    async fn rebuild_json(&self, system_prompt: &str, payload: &str) -> anyhow::Result<String>;
}

/// Which stage of the pipeline produced (or failed to produce) the object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixStage {
    Parsed,
    LlmFixed,
    LlmFallbackParsed,
    FallbackParsed,
    Failed(String),
}

impl std::fmt::Display for FixStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FixStage::Parsed => write!(f, "parsed"),
            FixStage::LlmFixed => write!(f, "llm_fixed"),
            FixStage::LlmFallbackParsed => write!(f, "llm_fallback_parsed"),
            FixStage::FallbackParsed => write!(f, "fallback_parsed"),
            FixStage::Failed(reason) => write!(f, "fail:{reason}"),
        }
    }
}

/// Recover a JSON object from noisy LLM text.
///
/// Stages, in order, stopping at the first success:
/// 1. prepare (sanitize, extract first balanced block, repair escapes)
/// 2. strict parse, requiring a mapping
/// 3. LLM rebuild when `rebuilder` is provided
/// 4. lenient local fallback (trailing commas, single quotes, forced
///    backslash doubling)
///
/// Returns `(None, FixStage::Failed(..))` when every stage fails.
pub async fn fix_and_parse(
    raw: &str,
    rebuilder: Option<&dyn JsonRebuild>,
) -> (Option<Map<String, Value>>, FixStage) {
    let json_str = match local_first_pass(raw) {
        Some(s) => s,
        None => {
            let reason = if raw.trim().is_empty() { "empty" } else { "not_found" };
            return (None, FixStage::Failed(reason.into()));
        }
    };

    if let Some(obj) = try_parse_object(&json_str) {
        return (Some(obj), FixStage::Parsed);
    }

    if let Some(llm) = rebuilder {
        match llm.rebuild_json(REBUILD_SYSTEM_PROMPT, &json_str).await {
            Ok(fixed_raw) => {
                let fixed = sanitize::strip_fences_outer_or_all(&fixed_raw);
                let fixed_json = sanitize::extract_first_json_block(&fixed, false);
                if !fixed_json.is_empty() {
                    let fixed_json = prepare_extracted(&fixed_json);
                    if let Some(obj) = try_parse_object(&fixed_json) {
                        return (Some(obj), FixStage::LlmFixed);
                    }
                    if let Some(obj) = fallback_parse(&fixed_json) {
                        return (Some(obj), FixStage::LlmFallbackParsed);
                    }
                }
            }
            Err(e) => debug!("json rebuild request failed: {e}"),
        }
    }

    if let Some(obj) = fallback_parse(&json_str) {
        return (Some(obj), FixStage::FallbackParsed);
    }

    (None, FixStage::Failed("unparseable".into()))
}

/// Local first pass: clean fences/control chars, extract the first balanced
/// object, repair invalid escapes and raw newlines.  Returns `None` when no
/// object-shaped text exists at all.
fn local_first_pass(raw: &str) -> Option<String> {
    if raw.trim().is_empty() {
        return None;
    }
    let content =
        sanitize::strip_fences_outer_or_all(&sanitize::clean_control_chars(raw, true));
    let json_str = sanitize::extract_first_json_block(&content, false);
    if json_str.is_empty() {
        return None;
    }
    Some(prepare_extracted(&json_str))
}

/// Escape repairs applied to an extracted JSON block before parsing.
fn prepare_extracted(json_str: &str) -> String {
    static BACKSLASH_EOL: OnceLock<Regex> = OnceLock::new();
    let backslash_eol = BACKSLASH_EOL.get_or_init(|| Regex::new(r"\\\r?\n").unwrap());

    let s = sanitize::fix_invalid_json_escapes(json_str);
    // A line-continuation backslash would otherwise break the string literal.
    let s = backslash_eol.replace_all(&s, "\\n");
    sanitize::escape_raw_newlines_in_json_strings(&s)
}

fn try_parse_object(json_str: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(json_str) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Lenient fallback, order matters: strip trailing commas, swap single
/// quotes for double quotes, force-double every non-standard backslash
/// inside string literals, then parse one last time.
fn fallback_parse(json_str: &str) -> Option<Map<String, Value>> {
    static TRAILING_OBJ: OnceLock<Regex> = OnceLock::new();
    static TRAILING_ARR: OnceLock<Regex> = OnceLock::new();
    let trailing_obj = TRAILING_OBJ.get_or_init(|| Regex::new(r",\s*\}").unwrap());
    let trailing_arr = TRAILING_ARR.get_or_init(|| Regex::new(r",\s*\]").unwrap());

    let safe = trailing_obj.replace_all(json_str, "}");
    let safe = trailing_arr.replace_all(&safe, "]");
    let safe = safe.replace('\'', "\"");
    let safe = force_double_backslashes_in_strings(&safe);
    try_parse_object(&safe)
}

/// Inside JSON string literals, double every lone backslash while leaving
/// the legal escapes (`\"` `\\` `\/` `\b` `\f` `\n` `\r` `\t` `\uXXXX`)
/// untouched.  Last-resort repair used only after the earlier stages failed.
fn force_double_backslashes_in_strings(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 16);
    let mut in_str = false;
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if !in_str {
            out.push(ch);
            if ch == '"' {
                in_str = true;
            }
            i += 1;
            continue;
        }
        if ch == '"' {
            out.push(ch);
            in_str = false;
            i += 1;
            continue;
        }
        if ch != '\\' {
            out.push(ch);
            i += 1;
            continue;
        }
        // Lone backslash at end of input.
        if i + 1 >= chars.len() {
            out.push_str("\\\\");
            i += 1;
            continue;
        }
        let next = chars[i + 1];
        if next == '\\' {
            out.push_str("\\\\");
            i += 2;
            continue;
        }
        if matches!(next, '"' | '/' | 'b' | 'f' | 'n' | 'r' | 't') {
            out.push('\\');
            out.push(next);
            i += 2;
            continue;
        }
        if next == 'u'
            && i + 5 < chars.len()
            && chars[i + 2..i + 6].iter().all(|c| c.is_ascii_hexdigit())
        {
            out.extend(&chars[i..i + 6]);
            i += 6;
            continue;
        }
        out.push_str("\\\\");
        out.push(next);
        i += 2;
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedRebuilder(&'static str);

    #[async_trait]
    impl JsonRebuild for CannedRebuilder {
        async fn rebuild_json(&self, _system: &str, _payload: &str) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingRebuilder;

    #[async_trait]
    impl JsonRebuild for FailingRebuilder {
        async fn rebuild_json(&self, _system: &str, _payload: &str) -> anyhow::Result<String> {
            anyhow::bail!("backend unavailable")
        }
    }

    // ── Stage 1+2: local parse ────────────────────────────────────────────────

    #[tokio::test]
    async fn fenced_llm_text_parses_locally() {
        // Chat filler around a fenced object with an escaped newline.
        let raw = "Sure, here is the result:\n```json\n{\"a\": 1, \"b\": \"x\\ny\"}\n```\nLet me know.";
        let (obj, stage) = fix_and_parse(raw, None).await;
        let obj = obj.expect("should parse");
        assert_eq!(stage, FixStage::Parsed);
        assert_eq!(obj["a"], 1);
        assert_eq!(obj["b"], "x\ny");
    }

    #[tokio::test]
    async fn latex_escapes_repaired_before_parse() {
        let raw = r#"{"formula": "\alpha + \gamma"}"#;
        let (obj, stage) = fix_and_parse(raw, None).await;
        assert_eq!(stage, FixStage::Parsed);
        assert_eq!(obj.unwrap()["formula"], r"\alpha + \gamma");
    }

    #[tokio::test]
    async fn raw_newline_inside_string_repaired() {
        let raw = "{\"text\": \"line one\nline two\"}";
        let (obj, stage) = fix_and_parse(raw, None).await;
        assert_eq!(stage, FixStage::Parsed);
        assert_eq!(obj.unwrap()["text"], "line one\nline two");
    }

    #[tokio::test]
    async fn top_level_array_is_not_accepted() {
        let (obj, stage) = fix_and_parse("[1, 2, 3]", None).await;
        assert!(obj.is_none());
        assert_eq!(stage, FixStage::Failed("not_found".into()));
    }

    // ── Stage 4: lenient fallback ─────────────────────────────────────────────

    #[tokio::test]
    async fn trailing_comma_recovered_by_fallback() {
        let raw = r#"{"a": 1, "b": 2,}"#;
        let (obj, stage) = fix_and_parse(raw, None).await;
        assert_eq!(stage, FixStage::FallbackParsed);
        assert_eq!(obj.unwrap()["b"], 2);
    }

    #[tokio::test]
    async fn single_quotes_recovered_by_fallback() {
        let raw = "{'key': 'value'}";
        let (obj, stage) = fix_and_parse(raw, None).await;
        assert_eq!(stage, FixStage::FallbackParsed);
        assert_eq!(obj.unwrap()["key"], "value");
    }

    // ── Stage 3: LLM rebuild ──────────────────────────────────────────────────

    #[tokio::test]
    async fn rebuilder_used_when_local_parse_fails() {
        // Unquoted key defeats both the strict parse and the fallback.
        let raw = "{broken: \"json\" oops}";
        let rb = CannedRebuilder(r#"{"fixed": true}"#);
        let (obj, stage) = fix_and_parse(raw, Some(&rb)).await;
        assert_eq!(stage, FixStage::LlmFixed);
        assert_eq!(obj.unwrap()["fixed"], true);
    }

    #[tokio::test]
    async fn rebuilder_failure_degrades_to_local_fallback() {
        let raw = r#"{"a": 1,}"#;
        // Force the strict stage to fail but keep the fallback viable, with a
        // rebuilder that errors: the local fallback must still win.
        let (obj, stage) = fix_and_parse(raw, Some(&FailingRebuilder)).await;
        assert_eq!(stage, FixStage::FallbackParsed);
        assert_eq!(obj.unwrap()["a"], 1);
    }

    #[tokio::test]
    async fn rebuilder_not_consulted_when_local_parse_succeeds() {
        // A rebuilder that would return garbage; stage must stay `parsed`.
        let rb = CannedRebuilder("not json at all");
        let (obj, stage) = fix_and_parse(r#"{"ok": 1}"#, Some(&rb)).await;
        assert_eq!(stage, FixStage::Parsed);
        assert!(obj.is_some());
    }

    // ── Failure tagging ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn empty_input_fails_with_empty_tag() {
        let (obj, stage) = fix_and_parse("   ", None).await;
        assert!(obj.is_none());
        assert_eq!(stage.to_string(), "fail:empty");
    }

    #[tokio::test]
    async fn prose_without_object_fails_with_not_found() {
        let (obj, stage) = fix_and_parse("no structured data here", None).await;
        assert!(obj.is_none());
        assert_eq!(stage.to_string(), "fail:not_found");
    }

    #[tokio::test]
    async fn hopeless_input_fails_unparseable() {
        let (obj, stage) = fix_and_parse("{: : :}", None).await;
        assert!(obj.is_none());
        assert_eq!(stage.to_string(), "fail:unparseable");
    }

    // ── force_double_backslashes_in_strings ───────────────────────────────────

    #[test]
    fn legal_escapes_survive_forced_doubling() {
        let s = r#"{"a": "x\ny A \\ \t"}"#;
        assert_eq!(force_double_backslashes_in_strings(s), s);
    }

    #[test]
    fn illegal_escapes_doubled_only_inside_strings() {
        let s = r#"{"a": "\left x \right"}"#;
        assert_eq!(
            force_double_backslashes_in_strings(s),
            r#"{"a": "\\left x \\right"}"#
        );
    }

    #[test]
    fn stage_display_matches_tags() {
        assert_eq!(FixStage::Parsed.to_string(), "parsed");
        assert_eq!(FixStage::LlmFixed.to_string(), "llm_fixed");
        assert_eq!(FixStage::LlmFallbackParsed.to_string(), "llm_fallback_parsed");
        assert_eq!(FixStage::FallbackParsed.to_string(), "fallback_parsed");
        assert_eq!(FixStage::Failed("x".into()).to_string(), "fail:x");
    }
}
