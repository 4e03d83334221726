use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeSet;

use log::debug;
use regex::Regex;
use saphyr_parser::{Event, Parser, ScalarStyle, ScanError};
use thiserror::Error;

use super::runs_on::{RunsOn, replace_labels};

/// The key this module rewrites.
const RUNS_ON_KEY: &str = "runs-on";

/// Errors that can occur when patching a workflow file
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("failed to parse workflow YAML")]
    Parse(#[source] ScanError),

    #[error("invalid line pattern")]
    Pattern(#[from] regex::Error),
}

/// Line shapes that decide where a `runs-on` block ends.
struct LinePatterns {
    list_item: Regex,
    blank: Regex,
    comment: Regex,
    next_key: Regex,
}

impl LinePatterns {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            list_item: Regex::new(r"^\s*-(\s|$)")?,
            blank: Regex::new(r"^\s*$")?,
            comment: Regex::new(r"^\s*#")?,
            next_key: Regex::new(r"^\s*[A-Za-z0-9_][A-Za-z0-9_-]*\s*:")?,
        })
    }
}

/// Minimal YAML tree with the source line of every scalar.
#[derive(Debug)]
enum Node {
    Scalar {
        value: String,
        plain: bool,
        /// Line reported by the parser for the start of the scalar
        line: usize,
    },
    Sequence(Vec<Node>),
    Mapping(Vec<(Node, Node)>),
    Alias,
}

/// A collection being built while events stream in.
enum Frame {
    Sequence(Vec<Node>),
    Mapping {
        pairs: Vec<(Node, Node)>,
        key: Option<Node>,
    },
}

impl Frame {
    fn push(&mut self, node: Node) {
        match self {
            Frame::Sequence(items) => items.push(node),
            Frame::Mapping { pairs, key } => match key.take() {
                Some(k) => pairs.push((k, node)),
                None => *key = Some(node),
            },
        }
    }

    fn finish(self) -> Node {
        match self {
            Frame::Sequence(items) => Node::Sequence(items),
            Frame::Mapping { pairs, .. } => Node::Mapping(pairs),
        }
    }
}

impl Node {
    /// Read this node as a `runs-on` value.
    fn to_runs_on(&self) -> RunsOn {
        match self {
            Node::Scalar { value, plain, .. } if !is_null(value, *plain) => {
                RunsOn::Label(value.clone())
            }
            Node::Sequence(items) => items
                .iter()
                .map(|item| match item {
                    Node::Scalar { value, .. } => Some(value.clone()),
                    Node::Sequence(_) | Node::Mapping(_) | Node::Alias => None,
                })
                .collect::<Option<Vec<_>>>()
                .map_or(RunsOn::Other, RunsOn::Labels),
            Node::Scalar { .. } | Node::Mapping(_) | Node::Alias => RunsOn::Other,
        }
    }
}

fn is_null(value: &str, plain: bool) -> bool {
    plain && matches!(value, "" | "~" | "null" | "Null" | "NULL")
}

/// Parse every document in `yaml` into a tree.
fn parse_documents(yaml: &str) -> Result<Vec<Node>, PatchError> {
    let mut documents = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();

    for next in Parser::new_from_str(yaml) {
        let (event, span) = next.map_err(PatchError::Parse)?;

        let node = match event {
            Event::MappingStart(..) => {
                stack.push(Frame::Mapping {
                    pairs: Vec::new(),
                    key: None,
                });
                continue;
            }
            Event::SequenceStart(..) => {
                stack.push(Frame::Sequence(Vec::new()));
                continue;
            }
            Event::MappingEnd | Event::SequenceEnd => match stack.pop() {
                Some(frame) => frame.finish(),
                None => continue,
            },
            Event::Scalar(value, style, ..) => Node::Scalar {
                value: value.to_string(),
                plain: matches!(style, ScalarStyle::Plain),
                line: span.start.line(),
            },
            Event::Alias(..) => Node::Alias,
            _ => continue,
        };

        match stack.last_mut() {
            Some(parent) => parent.push(node),
            None => documents.push(node),
        }
    }

    Ok(documents)
}

/// A pending replacement of `source[start..end]`.
#[derive(Debug)]
struct Edit {
    start: usize,
    end: usize,
    text: String,
}

/// Physical lines of the source with their byte offsets.
struct SourceLines<'a> {
    lines: Vec<&'a str>,
    patterns: LinePatterns,
    starts: Vec<usize>,
    len: usize,
}

impl<'a> SourceLines<'a> {
    fn new(source: &'a str, patterns: LinePatterns) -> Self {
        let lines: Vec<&str> = source.split('\n').collect();
        let mut starts = Vec::with_capacity(lines.len());
        let mut offset = 0usize;
        for line in &lines {
            starts.push(offset);
            offset = offset.saturating_add(line.len()).saturating_add(1);
        }
        Self {
            lines,
            patterns,
            starts,
            len: source.len(),
        }
    }

    fn get(&self, index: usize) -> Option<&'a str> {
        self.lines.get(index).copied()
    }

    fn start_of(&self, index: usize) -> usize {
        self.starts.get(index).copied().unwrap_or(self.len)
    }

    /// Offset just past the newline ending line `index`, clamped to the source length.
    fn end_of(&self, index: usize) -> usize {
        self.starts
            .get(index.saturating_add(1))
            .copied()
            .unwrap_or(self.len)
            .min(self.len)
    }

    /// Find the physical line holding a `runs-on` key the parser reported near
    /// `reported_line`.
    fn locate_key(&self, reported_line: usize) -> Option<usize> {
        let from = reported_line.saturating_sub(1);
        (from..self.lines.len()).find(|&index| {
            self.get(index)
                .is_some_and(|line| line.contains(RUNS_ON_KEY))
        })
    }

    /// Last line belonging to the value of the key at `column` on `key_line`.
    ///
    /// Lines indented past the key belong to it unless they start another key.
    /// At the key's own column only list items do. Blank and comment lines never
    /// end the block, but trailing ones are left outside it.
    fn block_end(&self, key_line: usize, column: usize) -> usize {
        let mut end = key_line;
        for index in key_line.saturating_add(1)..self.lines.len() {
            let Some(line) = self.get(index) else {
                break;
            };
            if self.patterns.blank.is_match(line) || self.patterns.comment.is_match(line) {
                continue;
            }
            let list_item = self.patterns.list_item.is_match(line);
            let continues = match leading_whitespace(line).len().cmp(&column) {
                Ordering::Less => false,
                Ordering::Equal => list_item,
                Ordering::Greater => list_item || !self.patterns.next_key.is_match(line),
            };
            if !continues {
                break;
            }
            end = index;
        }
        end
    }
}

fn leading_whitespace(line: &str) -> &str {
    let trimmed = line.trim_start();
    line.strip_suffix(trimmed).unwrap_or("")
}

/// Text in front of the `runs-on` key on its line, such as indentation or a
/// sequence item marker. Quotes around the key are dropped.
fn key_prefix(line: &str) -> &str {
    line.find(RUNS_ON_KEY)
        .and_then(|index| line.get(..index))
        .unwrap_or("")
        .trim_end_matches(['"', '\''])
}

/// Render `runs-on:` after `prefix`, with a block list two spaces past the key.
fn render_block(prefix: &str, labels: &[String]) -> String {
    let indent = " ".repeat(prefix.chars().count().saturating_add(2));
    let mut text = String::new();
    text.push_str(prefix);
    text.push_str(RUNS_ON_KEY);
    text.push_str(":\n");
    for label in labels {
        text.push_str(&indent);
        text.push_str("- ");
        text.push_str(&yaml_scalar(label));
        text.push('\n');
    }
    text
}

/// Emit `value` as a YAML scalar, quoting it when a plain scalar would be read as
/// something else.
fn yaml_scalar(value: &str) -> Cow<'_, str> {
    let starts_plain = value
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/'));
    let only_plain_chars = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    let reserved = matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "false" | "null" | "yes" | "no" | "on" | "off" | "y" | "n"
    );
    if starts_plain && only_plain_chars && !reserved && !looks_numeric(value) {
        return Cow::Borrowed(value);
    }

    let mut quoted = String::with_capacity(value.len().saturating_add(2));
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\t' => quoted.push_str("\\t"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    Cow::Owned(quoted)
}

/// True when a YAML 1.1 or 1.2 reader could resolve `value` as a number.
fn looks_numeric(value: &str) -> bool {
    let unsigned = value.strip_prefix(['+', '-']).unwrap_or(value);
    let lower = unsigned.to_ascii_lowercase();
    if matches!(lower.as_str(), ".inf" | ".nan") {
        return true;
    }

    let radix_digits = lower
        .strip_prefix("0x")
        .or_else(|| lower.strip_prefix("0o"))
        .or_else(|| lower.strip_prefix("0b"));
    if let Some(digits) = radix_digits {
        return digits.chars().any(|c| c.is_ascii_hexdigit())
            && digits.chars().all(|c| c.is_ascii_hexdigit() || c == '_');
    }

    lower.replace('_', "").parse::<f64>().is_ok()
}

/// Depth-first walk collecting an edit for every matching `runs-on` value.
fn collect_edits(
    node: &Node,
    source: &SourceLines<'_>,
    labels: &BTreeSet<String>,
    replacement: &str,
    edits: &mut Vec<Edit>,
) {
    match node {
        Node::Mapping(pairs) => {
            for (key, value) in pairs {
                let Node::Scalar {
                    value: name, line, ..
                } = key
                else {
                    collect_edits(value, source, labels, replacement, edits);
                    continue;
                };

                if name != RUNS_ON_KEY {
                    collect_edits(value, source, labels, replacement, edits);
                    continue;
                }

                let current = value.to_runs_on();
                if !current.intersects(labels) {
                    continue;
                }

                let Some(key_line) = source.locate_key(*line) else {
                    debug!("Could not locate runs-on key reported at line {line}");
                    continue;
                };
                let prefix = source.get(key_line).map_or("", key_prefix);
                let replaced = replace_labels(&current, labels, replacement);
                let end_line = source.block_end(key_line, prefix.len());

                edits.push(Edit {
                    start: source.start_of(key_line),
                    end: source.end_of(end_line),
                    text: render_block(prefix, &replaced),
                });
            }
        }
        Node::Sequence(items) => {
            for item in items {
                collect_edits(item, source, labels, replacement, edits);
            }
        }
        Node::Scalar { .. } | Node::Alias => {}
    }
}

/// Replace `runs-on` values that use any of `labels` with `replacement`, leaving the
/// rest of the document byte-for-byte intact.
///
/// Only the `runs-on` blocks that match are rewritten, as a block list indented two
/// spaces past the key. When nothing matches the input is returned borrowed and
/// unchanged.
///
/// # Errors
///
/// Returns `PatchError::Parse` if `yaml` is not valid YAML.
pub fn patch_runs_on<'a>(
    yaml: &'a str,
    labels: &BTreeSet<String>,
    replacement: &str,
) -> Result<Cow<'a, str>, PatchError> {
    let documents = parse_documents(yaml)?;
    let source = SourceLines::new(yaml, LinePatterns::new()?);

    let mut edits = Vec::new();
    for document in &documents {
        collect_edits(document, &source, labels, replacement, &mut edits);
    }

    if edits.is_empty() {
        return Ok(Cow::Borrowed(yaml));
    }

    edits.sort_by(|a, b| b.start.cmp(&a.start));

    let mut patched = yaml.to_string();
    let mut applied_from = usize::MAX;
    for edit in edits {
        // Each key is visited once, so only malformed boundaries could overlap
        if edit.end > applied_from {
            debug!("Skipping overlapping runs-on edit at offset {}", edit.start);
            continue;
        }
        patched.replace_range(edit.start..edit.end, &edit.text);
        applied_from = edit.start;
    }

    Ok(Cow::Owned(patched))
}

/// Collect the labels of every `runs-on` value under `node`, at any depth.
fn collect_labels(node: &Node, labels: &mut Vec<String>) {
    match node {
        Node::Mapping(pairs) => {
            for (key, value) in pairs {
                let is_runs_on =
                    matches!(key, Node::Scalar { value: name, .. } if name == RUNS_ON_KEY);
                if !is_runs_on {
                    collect_labels(value, labels);
                    continue;
                }
                for label in value.to_runs_on().labels() {
                    if !labels.iter().any(|known| known == label) {
                        labels.push(label.to_string());
                    }
                }
            }
        }
        Node::Sequence(items) => {
            for item in items {
                collect_labels(item, labels);
            }
        }
        Node::Scalar { .. } | Node::Alias => {}
    }
}

/// Distinct labels of every `runs-on` value in the workflow, in document order.
///
/// Values nested anywhere are read, not only those of top-level jobs.
///
/// # Errors
///
/// Returns `PatchError::Parse` if `yaml` is not valid YAML.
pub fn runs_on_labels(yaml: &str) -> Result<Vec<String>, PatchError> {
    let mut labels = Vec::new();
    for document in parse_documents(yaml)? {
        collect_labels(&document, &mut labels);
    }
    Ok(labels)
}
