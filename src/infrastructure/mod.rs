pub mod github;
pub mod labels;

pub use github::GithubPlatform;
pub use labels::{FileLabelStore, LABELS_FILE_NAME, LabelStore, LabelStoreError, MemoryLabelStore};
