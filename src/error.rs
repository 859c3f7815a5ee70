//! Error types for the alert relay.
//!
//! Scoring stages never surface these to callers; they log and degrade.
//! Only planning failures escape `Distributor::distribute`.

use thiserror::Error;

/// Errors raised inside the alert-to-notification pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A context, pattern, anomaly or hierarchy collaborator returned an error.
    #[error("collaborator '{source_name}' failed: {message}")]
    Collaborator {
        source_name: &'static str,
        message: String,
    },

    /// A collaborator did not answer within the configured timeout.
    #[error("collaborator '{source_name}' timed out")]
    CollaboratorTimeout { source_name: &'static str },

    /// A single notification task failed validation during enqueue.
    #[error("malformed task: {0}")]
    MalformedTask(String),

    /// No meaningful distribution plan could be built.
    #[error("planning failed: {0}")]
    Planning(String),

    /// Internal scoring error (non-finite score, deadline overflow).
    #[error("scoring failed: {0}")]
    Scoring(String),

    /// Hand-off to the channel dispatcher failed.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Build a collaborator failure from any displayable error.
    pub fn collaborator(source_name: &'static str, err: impl std::fmt::Display) -> Self {
        PipelineError::Collaborator {
            source_name,
            message: err.to_string(),
        }
    }

    /// Whether this error belongs to the planning class that must reach the caller.
    pub fn is_planning(&self) -> bool {
        matches!(self, PipelineError::Planning(_))
    }
}

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, PipelineError>;
