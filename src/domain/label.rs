use std::fmt;

use thiserror::Error;

/// Longest runner label GitHub accepts.
pub const MAX_LABEL_LENGTH: usize = 64;

/// Errors for replacement labels that can't be fixed automatically
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("label cannot be empty after cleanup")]
    Empty,

    #[error("label must be at most 64 characters")]
    TooLong,

    #[error("label can only contain lowercase letters, numbers, and hyphens: {0}")]
    InvalidCharacters(String),
}

/// A replacement label that passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(String);

/// Outcome of validating user input as a label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedLabel {
    pub label: Label,
    /// True when the input had to be cleaned up to become valid.
    pub corrected: bool,
}

impl Label {
    /// Validate `input` as a replacement label, fixing what can be fixed.
    ///
    /// Cleanup trims whitespace, lowercases, strips leading and trailing hyphens and
    /// collapses runs of hyphens. What remains must be 1 to 64 characters of
    /// `[a-z0-9-]`.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` when the cleaned value is empty, too long or
    /// contains other characters.
    pub fn parse(input: &str) -> Result<ValidatedLabel, ValidationError> {
        let lowered = input.trim().to_lowercase();
        let stripped = lowered.trim_matches('-');
        let mut value = String::with_capacity(stripped.len());
        for c in stripped.chars() {
            if c == '-' && value.ends_with('-') {
                continue;
            }
            value.push(c);
        }

        if value.is_empty() {
            return Err(ValidationError::Empty);
        }

        if value.chars().count() > MAX_LABEL_LENGTH {
            return Err(ValidationError::TooLong);
        }

        if !value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ValidationError::InvalidCharacters(value));
        }

        let corrected = value != input;
        Ok(ValidatedLabel {
            label: Self(value),
            corrected,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
