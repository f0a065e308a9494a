//! Output parsing error types

use thiserror::Error;

/// Terminal failures of [`crate::parse_output`]. Neither is retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("No JSON found in output")]
    NoStructuredOutput,

    #[error("Failed to parse JSON: {0}")]
    MalformedOutput(String),
}
