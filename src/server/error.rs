//! Error types for handler registration.

use crate::pattern::PatternKey;

/// Indicates that a handler could not be registered because the pattern is already taken.
#[derive(Debug, thiserror::Error)]
#[error("a handler is already registered for pattern {pattern}")]
pub struct PatternConflict {
    pub pattern: PatternKey,
}
