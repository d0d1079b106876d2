// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Figure discovery: stable posix-form relative paths under
//! `<section>/figures/`, plus the high-water-mark diff the coder uses to
//! report newly created images per subtask.

use std::collections::HashSet;
use std::path::Path;

use walkdir::WalkDir;

/// PNG paths under `<work_dir>/<section>/figures/`, relative to `work_dir`,
/// posix separators, sorted.
pub fn scan_section_figures(work_dir: &Path, section: &str) -> Vec<String> {
    let figures_dir = work_dir.join(section).join("figures");
    if !figures_dir.is_dir() {
        return Vec::new();
    }
    let mut paths: Vec<String> = WalkDir::new(&figures_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|x| x.to_str())
                .is_some_and(|x| x.eq_ignore_ascii_case("png"))
        })
        .filter_map(|e| {
            e.path()
                .strip_prefix(work_dir)
                .ok()
                .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    paths.sort();
    paths
}

/// All `<section>/figures/*.png` paths across every section directory in the
/// work dir, relative, posix-form, sorted.
pub fn scan_all_figures(work_dir: &Path) -> Vec<String> {
    let mut all = Vec::new();
    let entries = match std::fs::read_dir(work_dir) {
        Ok(e) => e,
        Err(_) => return all,
    };
    for entry in entries.filter_map(Result::ok) {
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(section) = entry.file_name().to_str() {
            all.extend(scan_section_figures(work_dir, section));
        }
    }
    all.sort();
    all
}

/// High-water mark over a section's figure set: `mark` captures the current
/// state at section entry, `new_since_mark` diffs against it.
#[derive(Debug, Default)]
pub struct FigureTracker {
    seen: HashSet<String>,
}

impl FigureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, work_dir: &Path, section: &str) {
        for p in scan_section_figures(work_dir, section) {
            self.seen.insert(p);
        }
    }

    pub fn new_since_mark(&self, work_dir: &Path, section: &str) -> Vec<String> {
        scan_section_figures(work_dir, section)
            .into_iter()
            .filter(|p| !self.seen.contains(p))
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, rel: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn section_scan_returns_sorted_relative_png_paths() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "eda/figures/b.png");
        touch(dir.path(), "eda/figures/a.png");
        touch(dir.path(), "eda/figures/notes.txt");
        let paths = scan_section_figures(dir.path(), "eda");
        assert_eq!(paths, vec!["eda/figures/a.png", "eda/figures/b.png"]);
    }

    #[test]
    fn section_scan_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_section_figures(dir.path(), "ques1").is_empty());
    }

    #[test]
    fn uppercase_extension_accepted() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "ques1/figures/F.PNG");
        assert_eq!(scan_section_figures(dir.path(), "ques1"), vec!["ques1/figures/F.PNG"]);
    }

    #[test]
    fn all_scan_covers_every_section() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "eda/figures/a.png");
        touch(dir.path(), "ques2/figures/b.png");
        touch(dir.path(), "sensitivity_analysis/figures/c.png");
        touch(dir.path(), "datasets/raw.csv");
        let all = scan_all_figures(dir.path());
        assert_eq!(
            all,
            vec![
                "eda/figures/a.png",
                "ques2/figures/b.png",
                "sensitivity_analysis/figures/c.png",
            ]
        );
    }

    #[test]
    fn tracker_diffs_against_marked_state() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "eda/figures/before.png");

        let mut tracker = FigureTracker::new();
        tracker.mark(dir.path(), "eda");

        touch(dir.path(), "eda/figures/after.png");
        let new = tracker.new_since_mark(dir.path(), "eda");
        assert_eq!(new, vec!["eda/figures/after.png"]);
    }

    #[test]
    fn tracker_fresh_section_reports_everything() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "ques1/figures/x.png");
        let tracker = FigureTracker::new();
        assert_eq!(tracker.new_since_mark(dir.path(), "ques1"), vec!["ques1/figures/x.png"]);
    }
}
