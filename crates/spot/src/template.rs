//! Script templates with `${NAME}` placeholders.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Template errors.
#[derive(Error, Debug)]
pub enum TemplateError {
    /// Template file could not be read.
    #[error("Failed to read template {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A script template loaded from disk.
#[derive(Debug, Clone)]
pub struct Template {
    text: String,
}

impl Template {
    /// Wrap template text.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Load a template file.
    ///
    /// # Errors
    /// Returns [`TemplateError::Read`] if the file cannot be read.
    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        std::fs::read_to_string(path)
            .map(Self::new)
            .map_err(|source| TemplateError::Read {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Replace every `${NAME}` with its value. Unknown placeholders are left
    /// untouched.
    #[must_use]
    pub fn render(&self, values: &[(&str, &str)]) -> String {
        render(&self.text, values)
    }
}

/// Replace every `${NAME}` in `text` with the matching value.
#[must_use]
pub fn render(text: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(text.to_string(), |acc, (name, value)| {
        acc.replace(&format!("${{{name}}}"), value)
    })
}
