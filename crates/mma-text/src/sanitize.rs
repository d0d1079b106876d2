// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Pure-function text transforms: control-character stripping, fence
//! removal, JSON block extraction, escape repair, and markdown image path
//! parsing.  All operations are idempotent where semantically meaningful.

use std::sync::OnceLock;

use regex::Regex;

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:\x9B|\x1B\[)[0-?]*[ -/]*[@-~]").unwrap())
}

fn fence_outer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^\s*```(?:[^\n`]*)?\s*\n(.*)\n```\s*$").unwrap())
}

fn fence_all_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:[^\n`]*)?\n(.*?)```").unwrap())
}

fn ques_fig_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^ques\d+/figures/").unwrap())
}

/// Remove C0 control characters and DEL.  With `keep_whitespace`, tab,
/// newline, and carriage return survive.
pub fn clean_control_chars(s: &str, keep_whitespace: bool) -> String {
    s.chars()
        .filter(|&c| {
            let ctrl = (c as u32) < 0x20 || c == '\u{7F}';
            if !ctrl {
                return true;
            }
            keep_whitespace && matches!(c, '\t' | '\n' | '\r')
        })
        .collect()
}

/// Remove CSI escape sequences (terminal colour codes leaked into tool
/// output).
pub fn strip_ansi(s: &str) -> String {
    ansi_re().replace_all(s, "").into_owned()
}

/// Normalise line endings, strip a BOM, and remove the `json` label noise
/// models wrap around JSON payloads (```json fences, bare `json` lines,
/// `json{` prefixes).
pub fn preclean_tool_wrappers(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    static JSON_FENCE: OnceLock<Regex> = OnceLock::new();
    static JSON_LINE: OnceLock<Regex> = OnceLock::new();
    static JSON_PREFIX: OnceLock<Regex> = OnceLock::new();
    let json_fence = JSON_FENCE.get_or_init(|| Regex::new(r"(?i)```json\b").unwrap());
    let json_line = JSON_LINE.get_or_init(|| Regex::new(r"(?im)^\s*json\s*$").unwrap());
    let json_prefix = JSON_PREFIX.get_or_init(|| Regex::new(r"(?i)\bjson\s*(\{)").unwrap());

    let t = s
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .trim_start_matches('\u{FEFF}')
        .to_string();
    let t = json_fence.replace_all(&t, "```");
    let t = json_line.replace_all(&t, "");
    json_prefix.replace_all(&t, "$1").into_owned()
}

/// If the entire string is a single fenced block (optional language tag),
/// unwrap it; otherwise strip every fence in place.  Applying this to
/// already-unfenced text is the identity (modulo outer whitespace).
pub fn strip_fences_outer_or_all(s: &str) -> String {
    let s = s.trim();
    if s.is_empty() {
        return String::new();
    }
    if let Some(caps) = fence_outer_re().captures(s) {
        return caps[1].trim().to_string();
    }
    fence_all_re().replace_all(s, "$1").trim().to_string()
}

/// Scan for the first `{` and walk the string tracking string-literal and
/// escape state until the matching `}`.  Returns the balanced substring, or
/// an empty string when no balanced object exists.
pub fn extract_first_json_block(s: &str, strip_fences_first: bool) -> String {
    if s.is_empty() {
        return String::new();
    }
    let base = if strip_fences_first {
        strip_fences_outer_or_all(s)
    } else {
        s.to_string()
    };
    let text = preclean_tool_wrappers(&base);

    let start = match text.find('{') {
        Some(i) => i,
        None => return String::new(),
    };
    let mut depth = 0usize;
    let mut in_str = false;
    let mut esc = false;
    for (i, ch) in text[start..].char_indices() {
        if in_str {
            if esc {
                esc = false;
            } else if ch == '\\' {
                esc = true;
            } else if ch == '"' {
                in_str = false;
            }
        } else {
            match ch {
                '"' => in_str = true,
                '{' => depth += 1,
                '}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return text[start..start + i + ch.len_utf8()].to_string();
                    }
                }
                _ => {}
            }
        }
    }
    String::new()
}

/// Double any backslash not followed by a valid JSON escape character
/// (`"` `\` `/` `b` `f` `n` `r` `t` `u`).  LaTeX fragments such as `\text`
/// or `\quad` inside LLM output are the usual offenders.
pub fn fix_invalid_json_escapes(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 16);
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some(&next) if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') => {
                out.push('\\');
                out.push(next);
                chars.next();
            }
            Some(_) => out.push_str("\\\\"),
            None => out.push_str("\\\\"),
        }
    }
    out
}

/// Inside JSON string literals only, convert raw `\n` / `\r` characters to
/// the two-character escape `\n`, and repair backslash-before-newline
/// continuations.  Whitespace outside string literals is untouched (JSON
/// allows it there).
pub fn escape_raw_newlines_in_json_strings(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_str = false;
    let mut esc = false;
    for ch in s.chars() {
        if in_str {
            if esc {
                if ch == '\n' || ch == '\r' {
                    out.push_str("\\n");
                } else {
                    out.push(ch);
                }
                esc = false;
            } else if ch == '\\' {
                out.push(ch);
                esc = true;
            } else if ch == '"' {
                out.push(ch);
                in_str = false;
            } else if ch == '\n' || ch == '\r' {
                out.push_str("\\n");
            } else {
                out.push(ch);
            }
        } else {
            out.push(ch);
            if ch == '"' {
                in_str = true;
            }
        }
    }
    out
}

/// Repair recurring key glitches seen in coordinator output: `"qu es2"` →
/// `"ques2"`, stray fence residue.
pub fn normalize_common_glitches(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    static SPLIT_QUES: OnceLock<Regex> = OnceLock::new();
    static SPACED_QUES: OnceLock<Regex> = OnceLock::new();
    let split_ques = SPLIT_QUES.get_or_init(|| Regex::new(r#""qu\s+es(\d+)""#).unwrap());
    let spaced_ques = SPACED_QUES.get_or_init(|| Regex::new(r#""\s*ques\s*(\d+)\s*""#).unwrap());

    let s = strip_fences_outer_or_all(s);
    let s = split_ques.replace_all(&s, "\"ques$1\"");
    spaced_ques.replace_all(&s, "\"ques$1\"").trim().to_string()
}

/// Extract every markdown image path (`![alt](path)`), allowing balanced
/// parentheses within the path and angle-bracket or quote-wrapped URLs.
pub fn extract_markdown_image_paths(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut paths = Vec::new();
    let mut i = 0usize;
    while let Some(rel) = text[i..].find("![") {
        let start = i + rel;
        let close_br = match text[start + 2..].find(']') {
            Some(p) => start + 2 + p,
            None => break,
        };
        if close_br + 1 >= bytes.len() || bytes[close_br + 1] != b'(' {
            i = close_br + 1;
            continue;
        }
        // Walk to the matching close paren, allowing nested pairs in the path.
        let mut p = close_br + 2;
        let mut depth = 0usize;
        let mut end = None;
        while p < bytes.len() {
            match bytes[p] {
                b'(' => depth += 1,
                b')' => {
                    if depth == 0 {
                        end = Some(p);
                        break;
                    }
                    depth -= 1;
                }
                _ => {}
            }
            p += 1;
        }
        let end = match end {
            Some(e) => e,
            None => break,
        };
        let raw_inside = text[close_br + 2..end].trim();
        let mut path = raw_inside.to_string();
        if path.starts_with('<') && path.ends_with('>') {
            path = path[1..path.len() - 1].trim().to_string();
        } else if let Some(qpos) = path.find('"').or_else(|| path.find('\'')) {
            // `![alt](path "title")` — keep only the URL part.
            let candidate = path[..qpos].trim().to_string();
            if !candidate.is_empty() {
                path = candidate;
            }
        }
        let path = path.trim().trim_matches('"').trim_matches('\'').trim();
        if !path.is_empty() {
            paths.push(path.to_string());
        }
        i = end + 1;
    }
    paths
}

/// Normalise a relative path: strip a leading `./` or `/`.
pub fn normalize_relpath(p: &str) -> String {
    let p = p.trim();
    let p = p.strip_prefix("./").unwrap_or(p);
    p.strip_prefix('/').unwrap_or(p).to_string()
}

/// Whether `p` points inside one of the section figure directories
/// (`eda/figures/`, `quesN/figures/`, `sensitivity_analysis/figures/`).
pub fn is_allowed_image_prefix(p: &str) -> bool {
    if p.is_empty() {
        return false;
    }
    let p = normalize_relpath(p);
    p.starts_with("eda/figures/")
        || p.starts_with("sensitivity_analysis/figures/")
        || ques_fig_prefix_re().is_match(&p)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
