pub mod label;
pub mod patch;
pub mod platform;
pub mod runs_on;
pub mod selection;
pub mod status;
pub mod workflow;

pub use label::{Label, MAX_LABEL_LENGTH, ValidatedLabel, ValidationError};
pub use patch::{PatchError, patch_runs_on, runs_on_labels};
pub use platform::{
    Branch, LabelOptions, Platform, PlatformError, RawWorkflow, Repository, SubmitOutcome,
    WorkflowEdit,
};
pub use runs_on::{ReplacementRule, RunsOn, replace_labels};
pub use selection::Selection;
pub use status::{OverallStatus, TaskResult, TaskStatus};
pub use workflow::{
    BranchKey, WorkflowFile, WorkflowPath, WorkflowPathError, decode_content, encode_content,
    group_by_branch, repository_in_path,
};
