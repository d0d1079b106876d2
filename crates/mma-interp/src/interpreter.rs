// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use mma_model::ToolSpec;

use crate::figures::FigureTracker;

/// Outcome of one code execution.  Interpreter-level failures (tracebacks,
/// kernel errors) are data, not transport errors — the coder feeds them back
/// to the model as reflection prompts.
#[derive(Debug, Clone, Default)]
pub struct Execution {
    /// Captured text output, one fragment per stream/cell.
    pub output: Vec<String>,
    pub error_occurred: bool,
    pub error_message: String,
}

impl Execution {
    pub fn ok(output: Vec<String>) -> Self {
        Self { output, error_occurred: false, error_message: String::new() }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self { output: Vec::new(), error_occurred: true, error_message: message.into() }
    }

    /// Joined output text with a fallback for silent executions.
    pub fn output_text(&self) -> String {
        let joined = self
            .output
            .iter()
            .map(String::as_str)
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if joined.trim().is_empty() {
            "(no captured output from execution)".to_string()
        } else {
            joined
        }
    }
}

/// Section-scoped code execution.  Implementations must return stable
/// posix-form relative paths under `<section>/figures/`.
#[async_trait]
pub trait CodeInterpreter: Send + Sync {
    /// Declare the subtask about to run; output files are namespaced by it.
    async fn add_section(&self, name: &str) -> anyhow::Result<()>;
    async fn execute_code(&self, code: &str) -> anyhow::Result<Execution>;
    /// Relative paths of images created since the section was entered.
    async fn get_created_images(&self, section: &str) -> anyhow::Result<Vec<String>>;
    async fn cleanup(&self) -> anyhow::Result<()>;
}

/// Wire schema of the single `execute_code` function tool.
pub fn execute_code_tool() -> ToolSpec {
    let mut spec = ToolSpec::function(
        "execute_code",
        "Execute Python code and return the captured terminal output. The code runs \
         in a persistent kernel: variables survive between calls. Rich outputs cannot \
         be displayed inline; save plots and data files into the working directory \
         and reference them by relative path.",
        json!({
            "type": "object",
            "properties": {
                "code": { "type": "string", "description": "The code text" }
            },
            "required": ["code"],
            "additionalProperties": false,
        }),
    );
    spec.function.strict = Some(true);
    spec
}

// ─── Mock interpreter ─────────────────────────────────────────────────────────

/// One scripted execution step for [`MockInterpreter`].
#[derive(Debug, Clone)]
pub struct MockStep {
    pub result: Execution,
    /// Figure files (relative paths) materialised on disk by this step.
    pub creates: Vec<String>,
}

/// Deterministic interpreter for agent tests: plays back scripted
/// executions, records the code it was given, and writes any scripted
/// figure files into the work dir so the scanning path is exercised too.
/// Section diffing goes through the same [`FigureTracker`] a real
/// interpreter uses.
pub struct MockInterpreter {
    work_dir: PathBuf,
    steps: Mutex<Vec<MockStep>>,
    executed: Mutex<Vec<String>>,
    tracker: Mutex<FigureTracker>,
}

impl MockInterpreter {
    pub fn new(work_dir: impl Into<PathBuf>, steps: Vec<MockStep>) -> Self {
        Self {
            work_dir: work_dir.into(),
            steps: Mutex::new(steps),
            executed: Mutex::new(Vec::new()),
            tracker: Mutex::new(FigureTracker::new()),
        }
    }

    /// All code snippets handed to `execute_code`, in order.
    pub async fn executed_code(&self) -> Vec<String> {
        self.executed.lock().await.clone()
    }
}

#[async_trait]
impl CodeInterpreter for MockInterpreter {
    async fn add_section(&self, name: &str) -> anyhow::Result<()> {
        self.tracker.lock().await.mark(&self.work_dir, name);
        Ok(())
    }

    async fn execute_code(&self, code: &str) -> anyhow::Result<Execution> {
        self.executed.lock().await.push(code.to_string());
        let step = {
            let mut steps = self.steps.lock().await;
            if steps.is_empty() {
                MockStep { result: Execution::ok(vec!["(scripted) done".into()]), creates: vec![] }
            } else {
                steps.remove(0)
            }
        };
        for rel in &step.creates {
            let path = self.work_dir.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, b"png")?;
        }
        Ok(step.result)
    }

    async fn get_created_images(&self, section: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.tracker.lock().await.new_since_mark(&self.work_dir, section))
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_code_tool_schema_shape() {
        let spec = execute_code_tool();
        assert_eq!(spec.spec_type, "function");
        assert_eq!(spec.function.name, "execute_code");
        assert_eq!(spec.function.strict, Some(true));
        let params = &spec.function.parameters;
        assert_eq!(params["type"], "object");
        assert_eq!(params["properties"]["code"]["type"], "string");
        assert_eq!(params["required"][0], "code");
    }

    #[test]
    fn execution_output_text_joins_fragments() {
        let e = Execution::ok(vec!["line 1".into(), "".into(), "line 2".into()]);
        assert_eq!(e.output_text(), "line 1\nline 2");
    }

    #[test]
    fn execution_output_text_falls_back_when_silent() {
        let e = Execution::ok(vec![]);
        assert_eq!(e.output_text(), "(no captured output from execution)");
        let e2 = Execution::ok(vec!["   ".into()]);
        assert_eq!(e2.output_text(), "(no captured output from execution)");
    }

    #[tokio::test]
    async fn mock_interpreter_records_code_and_plays_steps() {
        let dir = tempfile::tempdir().unwrap();
        let interp = MockInterpreter::new(
            dir.path(),
            vec![MockStep { result: Execution::ok(vec!["ran".into()]), creates: vec![] }],
        );
        let out = interp.execute_code("print('x')").await.unwrap();
        assert_eq!(out.output_text(), "ran");
        assert_eq!(interp.executed_code().await, vec!["print('x')"]);
    }

    #[tokio::test]
    async fn mock_interpreter_materialises_figures_and_diffs_them() {
        let dir = tempfile::tempdir().unwrap();
        // A pre-existing figure must not count as newly created.
        std::fs::create_dir_all(dir.path().join("eda/figures")).unwrap();
        std::fs::write(dir.path().join("eda/figures/old.png"), b"png").unwrap();

        let interp = MockInterpreter::new(
            dir.path(),
            vec![MockStep {
                result: Execution::ok(vec!["plotted".into()]),
                creates: vec!["eda/figures/fig_new.png".into()],
            }],
        );
        interp.add_section("eda").await.unwrap();
        interp.execute_code("plot()").await.unwrap();
        let created = interp.get_created_images("eda").await.unwrap();
        assert_eq!(created, vec!["eda/figures/fig_new.png"]);
    }

    #[tokio::test]
    async fn mock_interpreter_exhausted_script_returns_canned_success() {
        let dir = tempfile::tempdir().unwrap();
        let interp = MockInterpreter::new(dir.path(), vec![]);
        let out = interp.execute_code("x=1").await.unwrap();
        assert!(!out.error_occurred);
    }
}
