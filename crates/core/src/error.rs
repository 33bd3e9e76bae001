//! Validation error model shared across the conductor crates.

use thiserror::Error;

/// Result type for validation of identifiers, config and catalog data.
pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic validation failure.
///
/// Infrastructure failures (store unavailable, network errors) have their own
/// error types at each boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. a config knob out of range).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
