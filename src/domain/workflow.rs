use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::warn;
use thiserror::Error;

use super::patch::runs_on_labels;
use super::platform::RawWorkflow;

/// Separator between repository and branch in a `BranchKey`. Neither git nor
/// GitHub allow it in names.
const BRANCH_KEY_SEPARATOR: char = '\u{0}';

/// Errors that can occur when resolving a workflow's full path
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowPathError {
    #[error("invalid workflow path format: {0}")]
    Format(String),

    #[error("no branches known for {organisation}/{repository}")]
    UnknownRepository {
        organisation: String,
        repository: String,
    },

    #[error("could not resolve branch from path: {0}")]
    UnknownBranch(String),
}

/// A workflow's location: `organisation/repository/branch/workflow_path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkflowPath {
    pub organisation: String,
    pub repository: String,
    pub branch: String,
    pub workflow_path: String,
    /// The full slash-joined path, used as the file's stable key
    pub original_path: String,
}

impl WorkflowPath {
    /// Split a full path into its parts.
    ///
    /// Branch names may contain `/`, so the branch is the longest prefix of the
    /// remaining segments that names a known branch of the repository. When one
    /// branch name is a prefix of another (`release` and `release/2`), the longer one
    /// wins even if the file actually lives under a directory called `2` on
    /// `release`.
    ///
    /// # Errors
    ///
    /// Returns an error if the path has fewer than four segments, the repository has
    /// no known branches, or no prefix names a known branch.
    pub fn resolve(
        original_path: &str,
        branches: &BTreeMap<String, Vec<String>>,
    ) -> Result<Self, WorkflowPathError> {
        let parts: Vec<&str> = original_path.split('/').collect();
        let [organisation, repository, rest @ ..] = parts.as_slice() else {
            return Err(WorkflowPathError::Format(original_path.to_string()));
        };
        if rest.len() < 2 {
            return Err(WorkflowPathError::Format(original_path.to_string()));
        }

        let known = branches
            .get(*repository)
            .ok_or_else(|| WorkflowPathError::UnknownRepository {
                organisation: (*organisation).to_string(),
                repository: (*repository).to_string(),
            })?;

        // A file path needs at least one segment after the branch
        for split in (1..rest.len()).rev() {
            let (branch_parts, path_parts) = rest.split_at(split);
            let branch = branch_parts.join("/");
            if known.iter().any(|known_branch| *known_branch == branch) {
                return Ok(Self {
                    organisation: (*organisation).to_string(),
                    repository: (*repository).to_string(),
                    branch,
                    workflow_path: path_parts.join("/"),
                    original_path: original_path.to_string(),
                });
            }
        }

        Err(WorkflowPathError::UnknownBranch(original_path.to_string()))
    }

    #[must_use]
    pub fn branch_key(&self) -> BranchKey {
        BranchKey::new(&self.repository, &self.branch)
    }

    /// `organisation/repository/branch`
    #[must_use]
    pub fn branch_path(&self) -> String {
        format!("{}/{}/{}", self.organisation, self.repository, self.branch)
    }
}

/// Repository segment that follows `organisation` in a slash-joined path.
#[must_use]
pub fn repository_in_path<'a>(path: &'a str, organisation: &str) -> Option<&'a str> {
    let mut parts = path.split('/');
    parts.by_ref().find(|part| *part == organisation)?;
    parts.next().filter(|repository| !repository.is_empty())
}

impl fmt::Display for WorkflowPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original_path)
    }
}

/// Identifies one branch of one repository within the selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchKey(String);

impl BranchKey {
    #[must_use]
    pub fn new(repository: &str, branch: &str) -> Self {
        Self(format!("{repository}{BRANCH_KEY_SEPARATOR}{branch}"))
    }

    #[must_use]
    pub fn repository(&self) -> &str {
        self.0
            .split_once(BRANCH_KEY_SEPARATOR)
            .map_or(self.0.as_str(), |(repository, _)| repository)
    }

    #[must_use]
    pub fn branch(&self) -> &str {
        self.0
            .split_once(BRANCH_KEY_SEPARATOR)
            .map_or("", |(_, branch)| branch)
    }
}

impl fmt::Display for BranchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repository(), self.branch())
    }
}

/// A workflow file fetched from one branch of a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowFile {
    pub path: WorkflowPath,
    /// Labels used by the file's `runs-on` keys
    pub labels: Vec<String>,
    /// Decoded file content
    pub content: String,
}

impl WorkflowFile {
    /// Build a file from the platform's representation.
    ///
    /// Labels reported by the platform are used as they are. When there are none,
    /// they are read from the content.
    ///
    /// # Errors
    ///
    /// Returns an error if the path doesn't resolve against the known branches.
    pub fn from_raw(
        raw: RawWorkflow,
        branches: &BTreeMap<String, Vec<String>>,
    ) -> Result<Self, WorkflowPathError> {
        let path = WorkflowPath::resolve(&raw.path, branches)?;
        let content = decode_content(&raw.content);
        let labels = if raw.runs_on.is_empty() {
            runs_on_labels(&content).unwrap_or_else(|e| {
                warn!("Could not read runs-on labels of {}: {e}", raw.path);
                Vec::new()
            })
        } else {
            raw.runs_on
        };

        Ok(Self {
            path,
            labels,
            content,
        })
    }

    #[must_use]
    pub fn original_path(&self) -> &str {
        &self.path.original_path
    }

    #[must_use]
    pub fn repository(&self) -> &str {
        &self.path.repository
    }

    #[must_use]
    pub fn branch(&self) -> &str {
        &self.path.branch
    }

    #[must_use]
    pub fn branch_key(&self) -> BranchKey {
        self.path.branch_key()
    }
}

/// Decode base64 file content. Content that isn't valid base64 UTF-8 is returned
/// as it is.
#[must_use]
pub fn decode_content(content: &str) -> String {
    STANDARD
        .decode(content.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| content.to_string())
}

/// Encode file content for the platform.
#[must_use]
pub fn encode_content(content: &str) -> String {
    STANDARD.encode(content)
}

/// Group files by branch, keeping fetch order within each branch.
#[must_use]
pub fn group_by_branch(files: &[WorkflowFile]) -> BTreeMap<BranchKey, Vec<&WorkflowFile>> {
    let mut grouped: BTreeMap<BranchKey, Vec<&WorkflowFile>> = BTreeMap::new();
    for file in files {
        grouped.entry(file.branch_key()).or_default().push(file);
    }
    grouped
}
