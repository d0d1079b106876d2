// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;

use anyhow::Context;
use tracing::debug;

use crate::{LlmConfig, Settings};

/// Load settings from an optional YAML file, then apply environment
/// overrides.  Env vars always win over file values so containerised
/// deployments can be tuned without editing config files.
pub fn load(path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = match path {
        Some(p) => {
            debug!(path = %p.display(), "loading settings file");
            let text = std::fs::read_to_string(p)
                .with_context(|| format!("reading {}", p.display()))?;
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?
        }
        None => Settings::default(),
    };
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn apply_env_overrides(settings: &mut Settings) {
    if let Some(v) = env_usize("SOFT_TOKEN_LIMIT") {
        settings.limits.soft_token_limit = v;
    }
    if let Some(v) = env_usize("HARD_TOKEN_LIMIT") {
        settings.limits.hard_token_limit = v;
    }
    if let Some(v) = env_usize("MAX_CHAT_TURNS") {
        settings.limits.max_chat_turns = v as u32;
    }
    if let Some(v) = env_usize("MAX_RETRIES") {
        settings.limits.max_retries = v as u32;
    }
    if let Some(v) = env_bool("STRICT_JSON_ONLY") {
        settings.behavior.strict_json_only = v;
    }
    if let Some(v) = env_bool("LIGHT_CLEANING") {
        settings.behavior.light_cleaning = v;
    }
    if let Some(v) = env_bool("FORCE_TOOL_ON_FIRST_TRY") {
        settings.behavior.force_tool_on_first_try = v;
    }
    if let Some(v) = env_bool("SUPPORTS_TOOL_ROLE") {
        settings.behavior.supports_tool_role = v;
    }

    apply_llm_env("COORDINATOR", &mut settings.coordinator);
    apply_llm_env("MODELER", &mut settings.modeler);
    apply_llm_env("CODER", &mut settings.coder);
    apply_llm_env("WRITER", &mut settings.writer);
}

/// Per-agent endpoint overrides: `<PREFIX>_API_KEY`, `<PREFIX>_MODEL`,
/// `<PREFIX>_BASE_URL`.
fn apply_llm_env(prefix: &str, cfg: &mut LlmConfig) {
    if let Ok(v) = std::env::var(format!("{prefix}_API_KEY")) {
        if !v.is_empty() {
            cfg.api_key = Some(v);
        }
    }
    if let Ok(v) = std::env::var(format!("{prefix}_MODEL")) {
        if !v.is_empty() {
            cfg.model = v;
        }
    }
    if let Ok(v) = std::env::var(format!("{prefix}_BASE_URL")) {
        if !v.is_empty() {
            cfg.base_url = Some(v);
        }
    }
}

fn env_usize(var: &str) -> Option<usize> {
    std::env::var(var).ok()?.trim().parse().ok()
}

fn env_bool(var: &str) -> Option<bool> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_without_file_returns_defaults() {
        let s = load(None).unwrap();
        assert_eq!(s.limits.hard_token_limit, 120_000);
    }

    #[test]
    fn load_missing_explicit_file_is_an_error() {
        let result = load(Some(Path::new("/tmp/mma_nonexistent_settings.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "limits:\n  max_retries: 2\nwriter:\n  model: prose-model").unwrap();
        let s = load(Some(f.path())).unwrap();
        assert_eq!(s.limits.max_retries, 2);
        assert_eq!(s.writer.model, "prose-model");
    }

    #[test]
    fn env_bool_accepts_common_spellings() {
        std::env::set_var("MMA_TEST_BOOL_A", "TRUE");
        std::env::set_var("MMA_TEST_BOOL_B", "0");
        std::env::set_var("MMA_TEST_BOOL_C", "maybe");
        assert_eq!(env_bool("MMA_TEST_BOOL_A"), Some(true));
        assert_eq!(env_bool("MMA_TEST_BOOL_B"), Some(false));
        assert_eq!(env_bool("MMA_TEST_BOOL_C"), None);
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "limits:\n  soft_token_limit: 50").unwrap();
        std::env::set_var("SOFT_TOKEN_LIMIT", "75");
        let s = load(Some(f.path())).unwrap();
        std::env::remove_var("SOFT_TOKEN_LIMIT");
        assert_eq!(s.limits.soft_token_limit, 75);
    }

    #[test]
    fn per_agent_env_overrides_apply() {
        std::env::set_var("CODER_MODEL", "env-code-model");
        std::env::set_var("CODER_BASE_URL", "http://localhost:8080/v1");
        let s = load(None).unwrap();
        std::env::remove_var("CODER_MODEL");
        std::env::remove_var("CODER_BASE_URL");
        assert_eq!(s.coder.model, "env-code-model");
        assert_eq!(s.coder.base_url.as_deref(), Some("http://localhost:8080/v1"));
    }
}
