//! Error types shared by every component of the core.
//!
//! Three families of failure exist: configuration errors (band-count or
//! feature-length mismatches, unsorted band specs, tiling preconditions),
//! numerical errors (non-finite losses or gradients) and shape errors
//! (incompatible tensor dimensions). None of them is retried internally.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type GuardResult<T> = Result<T, GuardError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GuardError {
    /// A construction-time parameter violates its contract.
    #[error("invalid configuration for '{parameter}': {reason}")]
    Configuration { parameter: String, reason: String },

    /// A loss or gradient left the finite range.
    #[error("non-finite value {value} encountered in {context}")]
    Numerical { context: String, value: f32 },

    /// Tensor dimensions do not line up.
    #[error("shape mismatch in {context}: expected {expected}, found {found}")]
    Shape {
        context: String,
        expected: String,
        found: String,
    },
}

impl GuardError {
    pub fn configuration(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        GuardError::Configuration {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    pub fn numerical(context: impl Into<String>, value: f32) -> Self {
        GuardError::Numerical {
            context: context.into(),
            value,
        }
    }

    pub fn shape(
        context: impl Into<String>,
        expected: impl std::fmt::Debug,
        found: impl std::fmt::Debug,
    ) -> Self {
        GuardError::Shape {
            context: context.into(),
            expected: format!("{expected:?}"),
            found: format!("{found:?}"),
        }
    }

    /// True for failures the caller's run-level recovery is expected to handle.
    pub fn is_numerical(&self) -> bool {
        matches!(self, GuardError::Numerical { .. })
    }
}

/// Returns `value` if finite, otherwise a [`GuardError::Numerical`] tagged with `context`.
pub fn ensure_finite(context: &str, value: f32) -> GuardResult<f32> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(GuardError::numerical(context, value))
    }
}
