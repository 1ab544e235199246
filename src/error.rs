//! Error types for Decl.
//!
//! Construction and registration errors are returned synchronously to the
//! caller. Evaluation errors are contained inside a reconciliation pass and
//! reported out-of-band through the fault stream, so they only reach callers
//! that evaluate a matcher directly.

use thiserror::Error;

use crate::tree::TreeError;

/// Validation errors raised while building or registering rules.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid matcher: {reason}")]
    InvalidMatcherType {
        reason: String,
    },

    #[error("Invalid callback '{field}': {reason}")]
    InvalidCallbackType {
        field: String,
        reason: String,
    },

    #[error("Invalid rule: {reason}")]
    InvalidRuleType {
        reason: String,
    },
}

impl ValidationError {
    /// Shorthand for an `InvalidMatcherType` error.
    pub fn matcher(reason: impl Into<String>) -> Self {
        Self::InvalidMatcherType {
            reason: reason.into(),
        }
    }

    /// Shorthand for an `InvalidCallbackType` error.
    pub fn callback(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCallbackType {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while evaluating a matcher against the tree.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("Matcher produced an unsupported result: {reason}")]
    InvalidMatcherResult {
        reason: String,
    },

    #[error("Tree query failed: {0}")]
    Tree(#[from] TreeError),
}

/// Top-level error type for Decl.
#[derive(Debug, Error)]
pub enum DeclError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Configuration error: {message}")]
    Config {
        message: String,
    },

    #[error("The watched root cannot be changed while watching")]
    RootLocked,
}

impl DeclError {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an evaluation error.
    #[must_use]
    pub const fn is_evaluation(&self) -> bool {
        matches!(self, Self::Evaluation(_))
    }
}

/// Result type alias for Decl operations.
pub type DeclResult<T> = Result<T, DeclError>;
