//! Unified error types for the comment engine
//!
//! This module defines error types that:
//! - Are serializable for the presentation layer
//! - Separate fatal submission failures from per-step, logged-only failures
//! - Map transport and parse errors to user-facing variants

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type shared by every component
///
/// Only `AuthRequired` and `StoreWrite` abort a submission. The remaining
/// variants are either transient (`HostNotReady`) or reported per step.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "message")]
pub enum NotesError {
    #[error("Mail item not available after {attempts} attempts")]
    HostNotReady { attempts: u32 },

    #[error("Sign-in required: {0}")]
    AuthRequired(String),

    #[error("Failed to save comment: {0}")]
    StoreWrite(String),

    #[error("Failed to load comments: {0}")]
    StoreRead(String),

    #[error("Attachment '{file_name}' failed: {message}")]
    AttachmentTransfer { file_name: String, message: String },

    #[error("Failed to notify mentioned users: {0}")]
    Notification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl NotesError {
    /// Whether this error must abort the user-visible submit action
    pub fn aborts_submission(&self) -> bool {
        matches!(self, NotesError::AuthRequired(_) | NotesError::StoreWrite(_))
    }
}

// Implement From for common error types

impl From<std::io::Error> for NotesError {
    fn from(err: std::io::Error) -> Self {
        NotesError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for NotesError {
    fn from(err: toml::de::Error) -> Self {
        NotesError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for NotesError {
    fn from(err: serde_json::Error) -> Self {
        NotesError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for NotesError {
    fn from(err: reqwest::Error) -> Self {
        NotesError::Network(err.to_string())
    }
}

impl From<String> for NotesError {
    fn from(err: String) -> Self {
        NotesError::Other(err)
    }
}

impl From<&str> for NotesError {
    fn from(err: &str) -> Self {
        NotesError::Other(err.to_string())
    }
}

/// Result type alias using NotesError
pub type Result<T> = std::result::Result<T, NotesError>;
