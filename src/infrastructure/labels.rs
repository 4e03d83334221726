use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::Label;

pub const LABELS_FILE_NAME: &str = "relabel.toml";

/// Trait defining operations on the custom replacement labels a user has added
pub trait LabelStore {
    /// Custom labels in the order they were added
    fn labels(&self) -> &[String];

    /// Check if a custom label is stored
    fn has(&self, label: &str) -> bool {
        self.labels().iter().any(|stored| stored == label)
    }

    /// Add a custom label. Returns false if it was already stored.
    fn add(&mut self, label: &Label) -> bool;

    /// Remove a custom label. Returns false if it wasn't stored.
    fn remove(&mut self, label: &str) -> bool;

    /// Save the labels only if there were changes
    ///
    /// Required for file-based stores. It's a no-op for in-memory.
    ///
    /// # Errors
    ///
    /// Returns an error if saving is required but fails.
    fn save(&mut self) -> Result<(), LabelStoreError>;
}

/// Errors that can occur when working with the labels file
#[derive(Debug, Error)]
pub enum LabelStoreError {
    #[error("failed to read labels file: {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse labels file: {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error("failed to write labels file: {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize labels file to TOML")]
    Serialize(#[source] toml::ser::Error),

    #[error(
        "`FileLabelStore.path` not initialized. Use load_or_default or load to create a store with a path."
    )]
    PathNotInitialized,
}

/// Internal structure for TOML serialization
#[derive(Debug, Default, Deserialize, Serialize)]
struct LabelsData {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    replacement_labels: Vec<String>,
}

/// Custom labels persisted in a TOML file
#[derive(Debug, Default)]
pub struct FileLabelStore {
    labels: Vec<String>,
    path: Option<PathBuf>,
    changed: bool,
}

impl FileLabelStore {
    /// Get the path of the labels file.
    ///
    /// # Errors
    ///
    /// Return `PathNotInitialized` if the path is not initialized.
    pub fn path(&self) -> Result<&Path, LabelStoreError> {
        self.path
            .as_deref()
            .ok_or(LabelStoreError::PathNotInitialized)
    }

    /// Load the labels file from the given path.
    ///
    /// Entries that are not valid labels are dropped and the file is rewritten on
    /// the next save.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, LabelStoreError> {
        let content = fs::read_to_string(path).map_err(|source| LabelStoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let data: LabelsData =
            toml::from_str(&content).map_err(|source| LabelStoreError::Parse {
                path: path.to_path_buf(),
                source: Box::new(source),
            })?;

        let mut labels: Vec<String> = Vec::with_capacity(data.replacement_labels.len());
        for stored in &data.replacement_labels {
            if let Ok(validated) = Label::parse(stored) {
                let label = validated.label.into_string();
                if !labels.contains(&label) {
                    labels.push(label);
                }
            }
        }
        let changed = labels != data.replacement_labels;

        Ok(Self {
            labels,
            path: Some(path.to_path_buf()),
            changed,
        })
    }

    /// Load the labels file from the given path, or return an empty store if it
    /// doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> Result<Self, LabelStoreError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self {
                path: Some(path.to_path_buf()),
                ..Default::default()
            })
        }
    }

    fn save_to_disk(&self) -> Result<(), LabelStoreError> {
        let path = self.path()?;

        let data = LabelsData {
            replacement_labels: self.labels.clone(),
        };
        let content = toml::to_string_pretty(&data).map_err(LabelStoreError::Serialize)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LabelStoreError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }

        fs::write(path, content).map_err(|source| LabelStoreError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        info!("Labels file updated: {}", path.display());
        Ok(())
    }
}

impl LabelStore for FileLabelStore {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn add(&mut self, label: &Label) -> bool {
        if self.has(label.as_str()) {
            return false;
        }
        self.labels.push(label.as_str().to_string());
        self.changed = true;
        true
    }

    fn remove(&mut self, label: &str) -> bool {
        let before = self.labels.len();
        self.labels.retain(|stored| stored != label);
        let removed = self.labels.len() != before;
        self.changed |= removed;
        removed
    }

    fn save(&mut self) -> Result<(), LabelStoreError> {
        if self.changed {
            self.save_to_disk()?;
            self.changed = false;
        }
        Ok(())
    }
}

/// In-memory store for runs that shouldn't persist custom labels.
#[derive(Debug, Default)]
pub struct MemoryLabelStore {
    labels: Vec<String>,
}

impl LabelStore for MemoryLabelStore {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn add(&mut self, label: &Label) -> bool {
        if self.has(label.as_str()) {
            return false;
        }
        self.labels.push(label.as_str().to_string());
        true
    }

    fn remove(&mut self, label: &str) -> bool {
        let before = self.labels.len();
        self.labels.retain(|stored| stored != label);
        self.labels.len() != before
    }

    fn save(&mut self) -> Result<(), LabelStoreError> {
        Ok(())
    }
}
