use console::{Style, Term};
use log::warn;
use similar::TextDiff;
use std::io;

use crate::domain::{PatchError, ReplacementRule, Selection, WorkflowFile, patch_runs_on};

/// Lines of unchanged context around each change.
const CONTEXT_LINES: usize = 3;

/// New content for a workflow file that the rule modifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub original_path: String,
    pub repository: String,
    pub before: String,
    pub after: String,
}

impl FileChange {
    #[must_use]
    pub fn diff(&self) -> String {
        unified_diff(&self.before, &self.after, &self.original_path)
    }
}

/// Outcome of applying a rule to the selected files.
#[derive(Debug, Default)]
pub struct Plan {
    pub changes: Vec<FileChange>,
    /// Selected files the rule leaves as they are
    pub unchanged: usize,
    /// Files whose YAML couldn't be parsed
    pub failures: Vec<(String, PatchError)>,
}

/// Apply the rule to every selected file and keep the ones it modifies.
///
/// Files that fail to parse are reported and left out.
#[must_use]
pub fn plan_changes(files: &[WorkflowFile], selection: &Selection, rule: &ReplacementRule) -> Plan {
    let mut plan = Plan::default();
    let Some(replacement) = rule.replacement.as_deref() else {
        return plan;
    };

    for file in files {
        if !selection.is_selected(&file.branch_key(), file.original_path()) {
            continue;
        }

        match patch_runs_on(&file.content, &rule.labels_to_replace, replacement) {
            Ok(patched) if patched == file.content => {
                plan.unchanged = plan.unchanged.saturating_add(1);
            }
            Ok(patched) => plan.changes.push(FileChange {
                original_path: file.original_path().to_string(),
                repository: file.repository().to_string(),
                before: file.content.clone(),
                after: patched.into_owned(),
            }),
            Err(e) => {
                warn!("Skipping {}: {e}", file.original_path());
                plan.failures.push((file.original_path().to_string(), e));
            }
        }
    }
    plan
}

/// Unified diff of two texts with `a/` and `b/` headers. Empty when they are equal.
#[must_use]
pub fn unified_diff(before: &str, after: &str, path: &str) -> String {
    if before == after {
        return String::new();
    }

    TextDiff::from_lines(before, after)
        .unified_diff()
        .context_radius(CONTEXT_LINES)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string()
}

/// Write a unified diff to the terminal, colouring removed and added lines.
///
/// # Errors
///
/// Returns an error if the terminal cannot be written to.
pub fn print_diff(term: &Term, diff: &str) -> io::Result<()> {
    let header = Style::new().bold();
    let hunk = Style::new().cyan();
    let removed = Style::new().red();
    let added = Style::new().green();

    for line in diff.lines() {
        let styled = if line.starts_with("---") || line.starts_with("+++") {
            header.apply_to(line)
        } else if line.starts_with("@@") {
            hunk.apply_to(line)
        } else if line.starts_with('-') {
            removed.apply_to(line)
        } else if line.starts_with('+') {
            added.apply_to(line)
        } else {
            Style::new().apply_to(line)
        };
        term.write_line(&styled.to_string())?;
    }
    Ok(())
}
