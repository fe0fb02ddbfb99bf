//! Core error model.

use thiserror::Error;

/// Result type used by the phase catalog and identifier parsing.
pub type PhaseResult<T> = Result<T, PhaseError>;

/// Errors raised by pure lookups over the phase catalog.
///
/// An unknown phase at runtime means producers and workers disagree about the
/// catalog (deployment/version mismatch). Workers treat it as fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PhaseError {
    /// A phase name is not part of the registry.
    #[error("unknown phase: {0}")]
    UnknownPhase(String),

    /// The registry definition itself is invalid (empty, duplicate names).
    #[error("invalid phase registry: {0}")]
    InvalidRegistry(String),

    /// A job identifier does not end with a known phase suffix.
    #[error("malformed job id: {0}")]
    MalformedJobId(String),

    /// An identifier failed validation.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl PhaseError {
    pub fn unknown_phase(name: impl Into<String>) -> Self {
        Self::UnknownPhase(name.into())
    }

    pub fn invalid_registry(msg: impl Into<String>) -> Self {
        Self::InvalidRegistry(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
