// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The workflow sequencer: coordinator → modeler → per-subtask
//! coder/writer loops → assembled report.
//!
//! Image discipline lives here: each section's writer only sees figures
//! from its own `<section>/figures/` prefix, minus anything already
//! referenced elsewhere in the document (`used_images` is owned by the
//! workflow instance and passed explicitly, never global).

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use mma_channel::{MessagePayload, Publisher};
use mma_config::{AgentKind, CompTemplate, FormatOutput, Settings};
use mma_interp::{scan_all_figures, CodeInterpreter};
use mma_model::{HttpTransport, LlmClient};
use mma_text::sanitize;

use crate::coder::CoderAgent;
use crate::flows::{Flows, WRITE_KEYS};
use crate::output::ReportOutput;
use crate::writer::WriterAgent;
use crate::{CoordinatorAgent, ModelerAgent};

/// A modeling task as submitted by the caller.
#[derive(Debug, Clone)]
pub struct Problem {
    pub task_id: String,
    /// The raw problem statement, possibly spanning several questions.
    pub ques_all: String,
    pub comp_template: CompTemplate,
    pub format_output: FormatOutput,
}

impl Problem {
    pub fn new(task_id: impl Into<String>, ques_all: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ques_all: ques_all.into(),
            comp_template: CompTemplate::default(),
            format_output: FormatOutput::default(),
        }
    }
}

/// The four per-role chat clients of one workflow run.
pub struct AgentSet {
    pub coordinator: Arc<LlmClient>,
    pub modeler: Arc<LlmClient>,
    pub coder: Arc<LlmClient>,
    pub writer: Arc<LlmClient>,
}

impl AgentSet {
    /// Build clients over HTTP transports from the per-agent endpoint
    /// configuration.
    pub fn from_settings(
        task_id: &str,
        settings: &Settings,
        publisher: Arc<dyn Publisher>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            coordinator: http_client(task_id, AgentKind::Coordinator, settings, &publisher)?,
            modeler: http_client(task_id, AgentKind::Modeler, settings, &publisher)?,
            coder: http_client(task_id, AgentKind::Coder, settings, &publisher)?,
            writer: http_client(task_id, AgentKind::Writer, settings, &publisher)?,
        })
    }
}

fn http_client(
    task_id: &str,
    kind: AgentKind,
    settings: &Settings,
    publisher: &Arc<dyn Publisher>,
) -> anyhow::Result<Arc<LlmClient>> {
    let cfg = settings.llm_for(kind);
    let transport = Arc::new(
        HttpTransport::new(cfg, &settings.limits)
            .with_context(|| format!("building transport for {kind}"))?,
    );
    Ok(Arc::new(LlmClient::new(
        task_id,
        kind,
        cfg,
        &settings.limits,
        &settings.behavior,
        transport,
        publisher.clone(),
    )))
}

pub struct MathModelWorkflow {
    settings: Settings,
    publisher: Arc<dyn Publisher>,
}

impl MathModelWorkflow {
    pub fn new(settings: Settings, publisher: Arc<dyn Publisher>) -> Self {
        Self { settings, publisher }
    }

    /// Run the full pipeline for one problem.  Subtask-fatal errors are
    /// published as error notices and re-raised, aborting the workflow;
    /// partial work in the work dir is left in place.
    pub async fn execute(
        &self,
        problem: &Problem,
        work_dir: &Path,
        agents: AgentSet,
        interpreter: Arc<dyn CodeInterpreter>,
    ) -> anyhow::Result<ReportOutput> {
        let task_id = problem.task_id.as_str();
        let limits = &self.settings.limits;
        let behavior = &self.settings.behavior;

        self.publish(task_id, MessagePayload::info("decomposing the problem statement")).await;
        let mut coordinator = CoordinatorAgent::new(agents.coordinator, self.publisher.clone(), limits);
        let coordination = match coordinator.run(&problem.ques_all).await {
            Ok(c) => c,
            Err(e) => {
                error!("coordinator failed: {e:#}");
                self.publish(task_id, MessagePayload::error(format!("problem decomposition failed: {e}")))
                    .await;
                return Err(e);
            }
        };
        self.publish(
            task_id,
            MessagePayload::success(format!(
                "problem decomposed into {} questions",
                coordination.ques_count
            )),
        )
        .await;

        self.publish(task_id, MessagePayload::info("deriving modeling strategies")).await;
        let mut modeler = ModelerAgent::new(agents.modeler, self.publisher.clone(), limits);
        let strategies = match modeler.run(&coordination).await {
            Ok(s) => s,
            Err(e) => {
                error!("modeler failed: {e:#}");
                self.publish(task_id, MessagePayload::error(format!("modeling failed: {e}"))).await;
                return Err(e);
            }
        };

        let flows = Flows::new(coordination.ques_count);
        let mut report = ReportOutput::new(work_dir, coordination.ques_count);
        let mut used_images: HashSet<String> = HashSet::new();

        let mut coder = CoderAgent::new(
            agents.coder,
            self.publisher.clone(),
            interpreter.clone(),
            work_dir,
            limits,
            behavior,
        );
        let mut writer = WriterAgent::new(
            agents.writer,
            self.publisher.clone(),
            limits,
            problem.format_output,
        );

        // ── Solution subtasks: coder then writer ────────────────────────────
        for key in flows.solution_keys() {
            self.publish(task_id, MessagePayload::info(format!("coder solving {key}"))).await;
            let coder_prompt = flows.coder_prompt(&key, &coordination.questions, &strategies);
            let outcome = match coder.run(&coder_prompt, &key).await {
                Ok(o) => o,
                Err(e) => {
                    error!("coder failed on {key}: {e:#}");
                    self.publish(task_id, MessagePayload::error(format!("coder failed on {key}: {e}")))
                        .await;
                    return Err(e);
                }
            };
            self.publish(task_id, MessagePayload::success(format!("coder solved {key}"))).await;
            info!(subtask = %key, new_images = outcome.created_images.len(), "subtask solved");

            let all_images = scan_all_figures(work_dir);
            let available = filter_section_images(&all_images, &key, &used_images);

            self.publish(task_id, MessagePayload::info(format!("writing the {key} section"))).await;
            let writer_prompt =
                flows.solution_writer_prompt(&key, &outcome.coder_response, problem.comp_template);
            let text = match writer.run(&writer_prompt, available.clone(), &key).await {
                Ok(t) => t,
                Err(e) => {
                    error!("writer failed on {key}: {e:#}");
                    self.publish(task_id, MessagePayload::error(format!("writer failed on {key}: {e}")))
                        .await;
                    return Err(e);
                }
            };
            let text = rewrite_bare_image_refs(&text, &available);
            mark_used_references(&text, &available, &mut used_images);
            report.set(&key, text);
        }

        if let Err(e) = interpreter.cleanup().await {
            error!("interpreter cleanup failed: {e:#}");
        }

        // ── Writer-only subtasks ─────────────────────────────────────────────
        let model_summary = report.model_build_solve();
        for key in WRITE_KEYS {
            self.publish(task_id, MessagePayload::info(format!("writing the {key} section"))).await;
            let prompt = Flows::write_flow_prompt(
                key,
                coordination.background(),
                &problem.ques_all,
                &model_summary,
                problem.comp_template,
            );
            let all_images = scan_all_figures(work_dir);
            let available = filter_section_images(&all_images, key, &used_images);
            let text = match writer.run(&prompt, available.clone(), key).await {
                Ok(t) => t,
                Err(e) => {
                    error!("writer failed on {key}: {e:#}");
                    self.publish(task_id, MessagePayload::error(format!("writer failed on {key}: {e}")))
                        .await;
                    return Err(e);
                }
            };
            let text = rewrite_bare_image_refs(&text, &available);
            mark_used_references(&text, &available, &mut used_images);
            report.set(key, text);
        }

        let path = report.save()?;
        self.publish(
            task_id,
            MessagePayload::success(format!("report assembled at {}", path.display())),
        )
        .await;
        Ok(report)
    }

    async fn publish(&self, task_id: &str, payload: MessagePayload) {
        let _ = self.publisher.publish(task_id, payload).await;
    }
}

/// Restrict the discovered figures to one section's prefix and drop any
/// image already referenced elsewhere in the document.
fn filter_section_images(all: &[String], key: &str, used: &HashSet<String>) -> Vec<String> {
    let Some(prefix) = Flows::image_prefix(key) else {
        return Vec::new();
    };
    all.iter()
        .filter(|p| p.starts_with(&prefix))
        .filter(|p| !used.contains(*p))
        .cloned()
        .collect()
}

/// Rewrite bare-filename image references (`![x](fig.png)`) to the full
/// relative path of the matching available image.
fn rewrite_bare_image_refs(text: &str, available: &[String]) -> String {
    let by_basename: HashMap<&str, &str> = available
        .iter()
        .filter_map(|full| {
            full.rsplit('/').next().map(|base| (base, full.as_str()))
        })
        .collect();

    let mut out = text.to_string();
    for path in sanitize::extract_markdown_image_paths(text) {
        if path.contains('/') {
            continue;
        }
        if let Some(full) = by_basename.get(path.as_str()) {
            out = out.replace(&format!("]({path})"), &format!("]({full})"));
        }
    }
    out
}

/// Record every valid reference so later sections cannot reuse the image.
fn mark_used_references(text: &str, available: &[String], used: &mut HashSet<String>) {
    for path in sanitize::extract_markdown_image_paths(text) {
        if available.iter().any(|a| *a == path) {
            used.insert(path);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mma_channel::{MemoryPublisher, PayloadKind};
    use mma_config::{BehaviorConfig, LimitsConfig, LlmConfig};
    use mma_interp::{Execution, MockInterpreter, MockStep};
    use mma_model::mock::ScriptedStep;
    use mma_model::ScriptedTransport;

    // ── Image filtering helpers ───────────────────────────────────────────────

    #[test]
    fn filter_restricts_to_section_prefix() {
        let all = vec![
            "eda/figures/a.png".to_string(),
            "ques1/figures/b.png".to_string(),
            "sensitivity_analysis/figures/c.png".to_string(),
        ];
        let used = HashSet::new();
        assert_eq!(filter_section_images(&all, "eda", &used), vec!["eda/figures/a.png"]);
        assert_eq!(filter_section_images(&all, "ques1", &used), vec!["ques1/figures/b.png"]);
        assert!(filter_section_images(&all, "firstPage", &used).is_empty());
    }

    #[test]
    fn filter_drops_used_images() {
        let all = vec!["eda/figures/a.png".to_string(), "eda/figures/b.png".to_string()];
        let mut used = HashSet::new();
        used.insert("eda/figures/a.png".to_string());
        assert_eq!(filter_section_images(&all, "eda", &used), vec!["eda/figures/b.png"]);
    }

    #[test]
    fn bare_filenames_rewritten_to_full_paths() {
        let available = vec!["ques1/figures/fig_model.png".to_string()];
        let text = "See below.\n![model](fig_model.png)";
        let out = rewrite_bare_image_refs(text, &available);
        assert!(out.contains("![model](ques1/figures/fig_model.png)"));
    }

    #[test]
    fn full_path_references_left_untouched() {
        let available = vec!["eda/figures/a.png".to_string()];
        let text = "![x](eda/figures/a.png)";
        assert_eq!(rewrite_bare_image_refs(text, &available), text);
    }

    #[test]
    fn unknown_bare_filenames_not_rewritten() {
        let available = vec!["eda/figures/a.png".to_string()];
        let text = "![x](mystery.png)";
        assert_eq!(rewrite_bare_image_refs(text, &available), text);
    }

    #[test]
    fn mark_used_records_only_valid_references() {
        let available = vec!["eda/figures/a.png".to_string()];
        let mut used = HashSet::new();
        mark_used_references("![a](eda/figures/a.png) ![b](bogus.png)", &available, &mut used);
        assert!(used.contains("eda/figures/a.png"));
        assert_eq!(used.len(), 1);
    }

    // ── End-to-end workflow ───────────────────────────────────────────────────

    fn scripted_client(
        task_id: &str,
        kind: AgentKind,
        transport: Arc<ScriptedTransport>,
        publisher: Arc<dyn Publisher>,
        settings: &Settings,
    ) -> Arc<LlmClient> {
        Arc::new(LlmClient::new(
            task_id,
            kind,
            &LlmConfig { model: "test-model".into(), ..LlmConfig::default() },
            &settings.limits,
            &settings.behavior,
            transport,
            publisher,
        ))
    }

    fn exec_ok(text: &str, figure: &str) -> MockStep {
        MockStep { result: Execution::ok(vec![text.into()]), creates: vec![figure.into()] }
    }

    fn tool_step(id: &str, code: &str) -> ScriptedStep {
        ScriptedStep::ToolCall {
            id: id.into(),
            name: "execute_code".into(),
            arguments: format!(r#"{{"code": "{code}"}}"#),
        }
    }

    #[tokio::test]
    async fn full_pipeline_assembles_report() {
        let dir = tempfile::tempdir().unwrap();
        let publisher: Arc<MemoryPublisher> = Arc::new(MemoryPublisher::new());
        let settings = Settings {
            limits: LimitsConfig::default(),
            behavior: BehaviorConfig::default(),
            ..Settings::default()
        };

        let coordinator_t = Arc::new(ScriptedTransport::text(
            r#"{"title": "Growth", "background": "fish farm", "ques_count": 1, "ques1": "model the growth"}"#,
        ));
        let modeler_t = Arc::new(ScriptedTransport::text(
            r#"{"eda": "profile data", "ques1": "logistic model", "sensitivity_analysis": "perturb r"}"#,
        ));
        // Three coder subtasks, each: one execution then a summary.
        let coder_t = Arc::new(ScriptedTransport::new(vec![
            tool_step("c1", "print('eda')"),
            ScriptedStep::Text("EDA complete.".into()),
            tool_step("c2", "print('q1')"),
            ScriptedStep::Text("Question 1 solved.".into()),
            tool_step("c3", "print('sens')"),
            ScriptedStep::Text("Sensitivity done.".into()),
        ]));
        // Three solution sections referencing their figures, then the six
        // writer-only sections (the last step repeats).
        let writer_t = Arc::new(ScriptedTransport::new(vec![
            ScriptedStep::Text("EDA section.\n![hist](eda/figures/fig_eda.png)".into()),
            ScriptedStep::Text("Q1 section.\n![fit](ques1/figures/fig_q1.png)".into()),
            ScriptedStep::Text(
                "Sensitivity section.\n![tornado](sensitivity_analysis/figures/fig_sens.png)".into(),
            ),
            ScriptedStep::Text("Front matter section.".into()),
        ]));

        let interpreter = Arc::new(MockInterpreter::new(
            dir.path(),
            vec![
                exec_ok("eda out", "eda/figures/fig_eda.png"),
                exec_ok("q1 out", "ques1/figures/fig_q1.png"),
                exec_ok("sens out", "sensitivity_analysis/figures/fig_sens.png"),
            ],
        ));

        let task_id = "task-9";
        let agents = AgentSet {
            coordinator: scripted_client(task_id, AgentKind::Coordinator, coordinator_t, publisher.clone(), &settings),
            modeler: scripted_client(task_id, AgentKind::Modeler, modeler_t, publisher.clone(), &settings),
            coder: scripted_client(task_id, AgentKind::Coder, coder_t.clone(), publisher.clone(), &settings),
            writer: scripted_client(task_id, AgentKind::Writer, writer_t.clone(), publisher.clone(), &settings),
        };

        let workflow = MathModelWorkflow::new(settings, publisher.clone());
        let problem = Problem::new(task_id, "Model the growth of a fish population.");
        let report = workflow
            .execute(&problem, dir.path(), agents, interpreter.clone())
            .await
            .unwrap();

        // Every section landed, in order, with figure references intact.
        let doc = report.document();
        let eda = doc.find("EDA section").unwrap();
        let q1 = doc.find("Q1 section").unwrap();
        let front = doc.find("Front matter section").unwrap();
        assert!(front < eda && eda < q1);
        assert!(doc.contains("eda/figures/fig_eda.png"));
        assert!(doc.contains("ques1/figures/fig_q1.png"));

        // The report file was persisted into the work dir.
        let saved = std::fs::read_to_string(dir.path().join("report.md")).unwrap();
        assert_eq!(saved, doc);

        // All three subtasks ran code.
        assert_eq!(interpreter.executed_code().await.len(), 3);

        // The default (China) template's first-page scaffolding reached the
        // writer-only sections.
        let front_req = &writer_t.requests()[3];
        let front_user = front_req["messages"].as_array().unwrap().last().unwrap()["content"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(front_user.contains("keywords"));

        // The writer for ques1 only saw its own section's fresh figure.
        let q1_writer_req = &writer_t.requests()[1];
        let q1_user = q1_writer_req["messages"].as_array().unwrap().last().unwrap()["content"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(q1_user.contains("ques1/figures/fig_q1.png"));
        assert!(!q1_user.contains("eda/figures/fig_eda.png"));

        // Progress notices reached the channel, ending in a success.
        let snap = publisher.snapshot().await;
        assert!(snap.iter().any(|(ch, p)| {
            ch == task_id
                && matches!(&p.kind, PayloadKind::System { content, .. } if content.contains("report assembled"))
        }));
    }

    #[tokio::test]
    async fn coordinator_failure_aborts_and_publishes_error() {
        let dir = tempfile::tempdir().unwrap();
        let publisher: Arc<MemoryPublisher> = Arc::new(MemoryPublisher::new());
        let settings = Settings::default();

        let bad_coordinator = Arc::new(ScriptedTransport::text("not json"));
        let never = Arc::new(ScriptedTransport::text("unused"));
        let task_id = "task-err";
        let agents = AgentSet {
            coordinator: scripted_client(task_id, AgentKind::Coordinator, bad_coordinator, publisher.clone(), &settings),
            modeler: scripted_client(task_id, AgentKind::Modeler, never.clone(), publisher.clone(), &settings),
            coder: scripted_client(task_id, AgentKind::Coder, never.clone(), publisher.clone(), &settings),
            writer: scripted_client(task_id, AgentKind::Writer, never.clone(), publisher.clone(), &settings),
        };
        let interpreter = Arc::new(MockInterpreter::new(dir.path(), vec![]));

        let workflow = MathModelWorkflow::new(settings, publisher.clone());
        let problem = Problem::new(task_id, "whatever");
        let err = workflow
            .execute(&problem, dir.path(), agents, interpreter)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unparseable"));

        let snap = publisher.snapshot().await;
        assert!(snap.iter().any(|(_, p)| matches!(
            &p.kind,
            PayloadKind::System { level: mma_channel::NoticeLevel::Error, content }
                if content.contains("decomposition failed")
        )));
        assert_eq!(never.request_count(), 0, "downstream agents never ran");
    }
}
