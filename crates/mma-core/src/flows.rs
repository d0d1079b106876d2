// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Subtask ordering and per-subtask prompt assembly.
//!
//! The document sequence is fixed: writing-only front matter, then the
//! solution subtasks (`eda`, `ques1…quesN`, `sensitivity_analysis`), then
//! the judge section.  Solution subtasks run Coder → Writer; the rest are
//! writer-only.

use serde_json::{Map, Value};

use mma_config::CompTemplate;

use crate::modeler::ModelerOutput;

/// Writer-only subtasks, in document order (judge renders last).
pub const WRITE_KEYS: [&str; 6] = [
    "firstPage",
    "RepeatQues",
    "analysisQues",
    "modelAssumption",
    "symbol",
    "judge",
];

pub struct Flows {
    ques_count: u32,
}

impl Flows {
    pub fn new(ques_count: u32) -> Self {
        Self { ques_count }
    }

    /// Coder-then-writer subtasks in execution order.
    pub fn solution_keys(&self) -> Vec<String> {
        let mut keys = vec!["eda".to_string()];
        keys.extend((1..=self.ques_count).map(|i| format!("ques{i}")));
        keys.push("sensitivity_analysis".to_string());
        keys
    }

    /// Full document order used when assembling the final report.
    pub fn full_sequence(&self) -> Vec<String> {
        let mut seq: Vec<String> = vec![
            "firstPage".into(),
            "RepeatQues".into(),
            "analysisQues".into(),
            "modelAssumption".into(),
            "symbol".into(),
            "eda".into(),
        ];
        seq.extend((1..=self.ques_count).map(|i| format!("ques{i}")));
        seq.push("sensitivity_analysis".into());
        seq.push("judge".into());
        seq
    }

    /// Figure-directory prefix a section may reference, if any.
    pub fn image_prefix(key: &str) -> Option<String> {
        match key {
            "eda" => Some("eda/figures/".into()),
            "sensitivity_analysis" => Some("sensitivity_analysis/figures/".into()),
            k if k.starts_with("ques") => Some(format!("{k}/figures/")),
            _ => None,
        }
    }

    /// Prompt handed to the coder for one solution subtask.
    pub fn coder_prompt(
        &self,
        key: &str,
        questions: &Map<String, Value>,
        strategies: &ModelerOutput,
    ) -> String {
        let strategy = strategies
            .strategy(key)
            .unwrap_or("(no strategy provided; make reasonable modeling assumptions and proceed)");

        match key {
            "eda" => format!(
                "Modeling strategy from the modeling lead: {strategy}\n\
                 Perform exploratory data analysis on the datasets in the working directory.\n\
                 1) Assess data quality (missing values, types, outliers, duplicates) and clean \
                 accordingly; save cleaned data to eda/datasets/cleaned.csv.\n\
                 2) Univariate analysis: histograms with KDE for numeric columns, frequency bars \
                 for categorical columns.\n\
                 3) Bi/multivariate analysis: correlation heatmap, scatter plots, box plots.\n\
                 Save every figure as PNG under eda/figures/ with a semantic name \
                 (e.g. eda/figures/fig_corr_heatmap.png), and write a structured findings report \
                 to eda/reports/report_eda.txt. Finish by printing the table list, the cleaning \
                 summary, and the top five insights."
            ),
            "sensitivity_analysis" => format!(
                "Modeling strategy from the modeling lead: {strategy}\n\
                 Run a sensitivity analysis on the models built so far.\n\
                 1) Pick the target metric and up to ten candidate factors.\n\
                 2) Perturb each factor by ±10% and compute the change and elasticity of the \
                 target.\n\
                 Save a tornado chart to sensitivity_analysis/figures/tornado_sensitivity.png \
                 and response curves for the top factors under sensitivity_analysis/figures/. \
                 Write the summary table to sensitivity_analysis/datasets/sensitivity_summary.csv \
                 and the report to sensitivity_analysis/reports/report_sensitivity.txt. Finish by \
                 printing the top five factors with their elasticities."
            ),
            _ => {
                let question = questions.get(key).and_then(Value::as_str).unwrap_or_default();
                format!(
                    "Modeling strategy from the modeling lead: {strategy}\n\
                     Solve the following question end to end, saving figures under {key}/figures/ \
                     and intermediate results under {key}/:\n{question}"
                )
            }
        }
    }

    /// Prompt handed to the writer after a solution subtask completed.
    pub fn solution_writer_prompt(
        &self,
        key: &str,
        coder_response: &str,
        template: CompTemplate,
    ) -> String {
        format!(
            "Write the {key} section of the paper based on the completed solution work \
             below. Present the approach, the results, and their interpretation. {}\n\n\
             Solution notes:\n{coder_response}",
            template_style_note(template),
        )
    }

    /// Prompt for a writer-only section, scaffolded by the competition
    /// template.
    pub fn write_flow_prompt(
        key: &str,
        background: &str,
        ques_all: &str,
        model_summary: &str,
        template: CompTemplate,
    ) -> String {
        let scaffold = section_template(template, key);
        if scaffold.is_empty() {
            return format!("Write the {key} section.");
        }
        format!(
            "Problem background:\n{background}\n\nOriginal problem statement:\n{ques_all}\n\n\
             Completed modeling and solution summary:\n{model_summary}\n\n\
             Write following this section template: {scaffold} \
             No code is required for this section."
        )
    }
}

/// One style sentence applied to every solution section.
fn template_style_note(template: CompTemplate) -> &'static str {
    match template {
        CompTemplate::China => {
            "Follow the national competition paper conventions: dense, formula-driven \
             exposition with numbered equations."
        }
        CompTemplate::American => {
            "Follow MCM/ICM paper conventions: readable academic English with clearly \
             labelled models and figures."
        }
    }
}

/// Per-section scaffolding the writer must follow, keyed by the competition
/// template.  Mirrors the per-template section templates the write-only
/// prompts are assembled from.
fn section_template(template: CompTemplate, key: &str) -> &'static str {
    match (template, key) {
        (CompTemplate::China, "firstPage") => {
            "a centered title, an abstract of 300-500 words covering the problem, the \
             models used, the solving methods, and the headline numeric results, then \
             3-5 keywords on their own line."
        }
        (CompTemplate::American, "firstPage") => {
            "a one-page summary sheet addressed to the judges: title, then a summary \
             restating the problem, the modeling approach, and the headline results. \
             No keyword list."
        }
        (CompTemplate::China, "RepeatQues") => {
            "a problem restatement: background first, then each question restated in \
             the team's own words."
        }
        (CompTemplate::American, "RepeatQues") => {
            "an introduction: problem background, a restatement of the tasks, and an \
             overview of the paper's structure."
        }
        (CompTemplate::China, "analysisQues") => {
            "a problem analysis section, one subsection per question, each linking the \
             question to the model chosen for it."
        }
        (CompTemplate::American, "analysisQues") => {
            "a task analysis section describing, task by task, what must be modeled \
             and how the tasks depend on each other."
        }
        (_, "modelAssumption") => {
            "a numbered list of model assumptions, each with a one-sentence \
             justification."
        }
        (CompTemplate::China, "symbol") => {
            "a notation table with columns Symbol, Meaning, and Unit."
        }
        (CompTemplate::American, "symbol") => {
            "a notation table with columns Symbol and Definition."
        }
        (CompTemplate::China, "judge") => {
            "a model evaluation: strengths, weaknesses, and possible improvements and \
             extensions."
        }
        (CompTemplate::American, "judge") => {
            "a strengths-and-weaknesses discussion, including robustness remarks tied \
             to the sensitivity analysis."
        }
        _ => "",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
