//! Workflow document parsing.
//!
//! Loads YAML files into `WorkflowDocument`. Parsing only checks
//! the document's shape; the structural and reference checks live in
//! [`super::validator`] so they can report every violation at once.

use std::path::Path;

use paws_types::workflow::WorkflowDocument;
use thiserror::Error;

/// Errors that can occur while loading a document.
#[derive(Debug, Error)]
pub enum DocumentLoadError {
    /// YAML parse failure, including missing or unknown top-level sections.
    #[error("parse error: {0}")]
    Parse(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse a YAML string into a `WorkflowDocument`.
pub fn parse_document_yaml(yaml: &str) -> Result<WorkflowDocument, DocumentLoadError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| DocumentLoadError::Parse(e.to_string()))
}

/// Load a workflow document from a YAML file.
pub fn load_document_file(path: &Path) -> Result<WorkflowDocument, DocumentLoadError> {
    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Err(DocumentLoadError::Parse(format!(
            "empty workflow file: {}",
            path.display()
        )));
    }
    parse_document_yaml(&content)
}
