use indexmap::{IndexMap, IndexSet};

use super::runs_on::ReplacementRule;
use super::workflow::{BranchKey, WorkflowFile};

/// Files picked for the next commit, grouped by branch.
///
/// A branch is present only while at least one of its files is selected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    files_by_branch: IndexMap<BranchKey, IndexSet<String>>,
}

impl Selection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Select every given file, keeping what is already selected.
    pub fn prefill<'a, I>(&mut self, files: I)
    where
        I: IntoIterator<Item = &'a WorkflowFile>,
    {
        for file in files {
            self.files_by_branch
                .entry(file.branch_key())
                .or_default()
                .insert(file.original_path().to_string());
        }
    }

    /// Replace the selection with the files the rule would change.
    pub fn select_matching<'a, I>(&mut self, files: I, rule: &ReplacementRule)
    where
        I: IntoIterator<Item = &'a WorkflowFile>,
    {
        self.files_by_branch.clear();
        for file in files {
            if file
                .labels
                .iter()
                .any(|label| rule.labels_to_replace.contains(label))
            {
                self.files_by_branch
                    .entry(file.branch_key())
                    .or_default()
                    .insert(file.original_path().to_string());
            }
        }
    }

    /// Flip one file in or out of the selection.
    pub fn toggle_file(&mut self, branch: &BranchKey, original_path: &str) {
        let paths = self.files_by_branch.entry(branch.clone()).or_default();
        if !paths.shift_remove(original_path) {
            paths.insert(original_path.to_string());
        }
        if paths.is_empty() {
            self.files_by_branch.shift_remove(branch);
        }
    }

    /// Select all of a branch's files, or clear the branch if all of them are already
    /// selected.
    pub fn toggle_branch<S: AsRef<str>>(&mut self, branch: &BranchKey, branch_files: &[S]) {
        let all_selected = self.files_by_branch.get(branch).is_some_and(|selected| {
            branch_files
                .iter()
                .all(|path| selected.contains(path.as_ref()))
        });

        if all_selected || branch_files.is_empty() {
            self.files_by_branch.shift_remove(branch);
        } else {
            self.files_by_branch.insert(
                branch.clone(),
                branch_files
                    .iter()
                    .map(|path| path.as_ref().to_string())
                    .collect(),
            );
        }
    }

    #[must_use]
    pub fn is_selected(&self, branch: &BranchKey, original_path: &str) -> bool {
        self.files_by_branch
            .get(branch)
            .is_some_and(|paths| paths.contains(original_path))
    }

    /// Selected paths of a branch, in selection order.
    #[must_use]
    pub fn files(&self, branch: &BranchKey) -> Option<&IndexSet<String>> {
        self.files_by_branch.get(branch)
    }

    pub fn branches(&self) -> impl Iterator<Item = &BranchKey> {
        self.files_by_branch.keys()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files_by_branch.is_empty()
    }

    /// Total number of selected files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files_by_branch.values().map(IndexSet::len).sum()
    }

    pub fn clear(&mut self) {
        self.files_by_branch.clear();
    }
}
