// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Accumulates the per-section writer output and persists the assembled
//! document.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::info;

use crate::flows::Flows;

#[derive(Debug)]
pub struct ReportOutput {
    work_dir: PathBuf,
    ques_count: u32,
    sections: HashMap<String, String>,
}

impl ReportOutput {
    pub fn new(work_dir: impl Into<PathBuf>, ques_count: u32) -> Self {
        Self { work_dir: work_dir.into(), ques_count, sections: HashMap::new() }
    }

    pub fn set(&mut self, key: &str, content: String) {
        self.sections.insert(key.to_string(), content);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.sections.get(key).map(String::as_str)
    }

    /// The solution portion (eda, quesN, sensitivity analysis) joined in
    /// order — context for the writer-only front-matter sections.
    pub fn model_build_solve(&self) -> String {
        Flows::new(self.ques_count)
            .solution_keys()
            .iter()
            .filter_map(|k| self.sections.get(k))
            .cloned()
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// The full document in the fixed section order; missing sections are
    /// skipped.
    pub fn document(&self) -> String {
        Flows::new(self.ques_count)
            .full_sequence()
            .iter()
            .filter_map(|k| self.sections.get(k))
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Write the assembled document to `report.md` in the work dir.
    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let path = self.work_dir.join("report.md");
        std::fs::write(&path, self.document())
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), sections = self.sections.len(), "report saved");
        Ok(path)
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
