use indexmap::IndexSet;
use log::{debug, info};
use thiserror::Error;

use crate::domain::{Label, LabelOptions, ValidationError};
use crate::infrastructure::{LabelStore, LabelStoreError};

/// Errors when choosing a replacement label
#[derive(Debug, Error)]
pub enum LabelChoiceError {
    #[error("invalid replacement label {input:?}")]
    Invalid {
        input: String,
        #[source]
        source: ValidationError,
    },

    #[error(transparent)]
    Store(#[from] LabelStoreError),
}

/// Server labels followed by the stored custom labels, without duplicates.
#[must_use]
pub fn merge_label_options<S: LabelStore + ?Sized>(server: &LabelOptions, store: &S) -> Vec<String> {
    let merged: IndexSet<&str> = server
        .labels
        .iter()
        .chain(store.labels())
        .map(String::as_str)
        .collect();
    merged.into_iter().map(ToString::to_string).collect()
}

/// Resolve the label that replaces the matched ones.
///
/// Server labels are used as they are. Anything else is validated, corrected
/// when possible and remembered as a custom label.
///
/// # Errors
///
/// Returns `LabelChoiceError::Invalid` if the input can't be turned into a label,
/// or `LabelChoiceError::Store` if the custom label can't be saved.
pub fn choose_replacement<S: LabelStore + ?Sized>(
    input: &str,
    server: &LabelOptions,
    store: &mut S,
) -> Result<String, LabelChoiceError> {
    if server.labels.iter().any(|label| label == input) {
        debug!("Using server label {input}");
        return Ok(input.to_string());
    }

    let validated = Label::parse(input).map_err(|source| LabelChoiceError::Invalid {
        input: input.to_string(),
        source,
    })?;
    if validated.corrected {
        info!("Replacement label corrected from {input:?} to {}", validated.label);
    }

    let label = validated.label;
    if server.labels.iter().any(|known| known == label.as_str()) {
        return Ok(label.into_string());
    }
    if store.add(&label) {
        store.save()?;
        info!("Added custom label {label}");
    }
    Ok(label.into_string())
}

/// Validate and store a custom label.
///
/// Returns the stored label and whether it was new.
///
/// # Errors
///
/// Returns an error if the label is invalid or the store can't be saved.
pub fn add_custom_label<S: LabelStore + ?Sized>(
    input: &str,
    store: &mut S,
) -> Result<(Label, bool), LabelChoiceError> {
    let validated = Label::parse(input).map_err(|source| LabelChoiceError::Invalid {
        input: input.to_string(),
        source,
    })?;
    if validated.corrected {
        info!("Label corrected from {input:?} to {}", validated.label);
    }
    let added = store.add(&validated.label);
    store.save()?;
    Ok((validated.label, added))
}

/// Remove a custom label. Returns false if it wasn't stored.
///
/// # Errors
///
/// Returns an error if the store can't be saved.
pub fn remove_custom_label<S: LabelStore + ?Sized>(
    label: &str,
    store: &mut S,
) -> Result<bool, LabelStoreError> {
    let removed = store.remove(label);
    store.save()?;
    Ok(removed)
}
