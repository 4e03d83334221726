use serde::Deserialize;
use serde::de::IgnoredAny;
use std::collections::BTreeSet;
use std::fmt;

/// The value of a `runs-on:` key as written in a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawRunsOn")]
pub enum RunsOn {
    /// `runs-on: ubuntu-latest`
    Label(String),
    /// `runs-on: [self-hosted, linux]` or the block list form
    Labels(Vec<String>),
    /// Anything else: runner groups (`{group: ...}`), null, aliases
    Other,
}

/// Wire shape of `runs-on`, accepting any YAML value.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawRunsOn {
    Label(String),
    Labels(Vec<String>),
    Other(IgnoredAny),
}

impl From<RawRunsOn> for RunsOn {
    fn from(raw: RawRunsOn) -> Self {
        match raw {
            RawRunsOn::Label(label) => RunsOn::Label(label),
            RawRunsOn::Labels(labels) => RunsOn::Labels(labels),
            RawRunsOn::Other(IgnoredAny) => RunsOn::Other,
        }
    }
}

impl RunsOn {
    /// The labels carried by this value, in source order.
    /// `Other` carries none.
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        match self {
            RunsOn::Label(label) => vec![label.as_str()],
            RunsOn::Labels(labels) => labels.iter().map(String::as_str).collect(),
            RunsOn::Other => Vec::new(),
        }
    }

    /// Returns true if any label is in `labels`.
    #[must_use]
    pub fn intersects(&self, labels: &BTreeSet<String>) -> bool {
        self.labels().iter().any(|label| labels.contains(*label))
    }
}

impl fmt::Display for RunsOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunsOn::Label(label) => write!(f, "{label}"),
            RunsOn::Labels(labels) => write!(f, "[{}]", labels.join(", ")),
            RunsOn::Other => write!(f, "<unsupported>"),
        }
    }
}

/// Collapse every label of `current` found in `labels` into a single `replacement`
/// placed where the first match was.
///
/// Labels that don't match keep their relative order. A scalar value behaves like a
/// one-element list, and an unsupported value yields an empty list.
///
/// ```
/// use relabel::domain::{RunsOn, replace_labels};
/// use std::collections::BTreeSet;
///
/// let current = RunsOn::Labels(vec!["a".into(), "b".into(), "a".into()]);
/// let labels = BTreeSet::from(["a".to_string()]);
/// assert_eq!(replace_labels(&current, &labels, "x"), vec!["x", "b"]);
/// ```
#[must_use]
pub fn replace_labels(
    current: &RunsOn,
    labels: &BTreeSet<String>,
    replacement: &str,
) -> Vec<String> {
    let mut result = Vec::new();
    let mut replaced = false;

    for label in current.labels() {
        if !labels.contains(label) {
            result.push(label.to_string());
        } else if !replaced {
            result.push(replacement.to_string());
            replaced = true;
        }
    }

    result
}

/// What the user asked to replace, and with what.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplacementRule {
    pub labels_to_replace: BTreeSet<String>,
    pub replacement: Option<String>,
}

impl ReplacementRule {
    #[must_use]
    pub fn new<I, S>(labels_to_replace: I, replacement: Option<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels_to_replace: labels_to_replace.into_iter().map(Into::into).collect(),
            replacement,
        }
    }

    /// A rule applies to a file only when it has a replacement and the file uses one
    /// of the labels being replaced.
    #[must_use]
    pub fn is_active_for<S: AsRef<str>>(&self, file_labels: &[S]) -> bool {
        self.replacement.is_some()
            && file_labels
                .iter()
                .any(|label| self.labels_to_replace.contains(label.as_ref()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels_to_replace.is_empty()
    }
}
