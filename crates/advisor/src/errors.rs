use serde::{Deserialize, Serialize};
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, Clone, Deserialize, Serialize, PartialEq)]
pub enum AdvisorError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Language model error: {0}")]
    Provider(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AdvisorResult<T> = Result<T, AdvisorError>;

/// Failures reported by the persistence collaborators.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Conversation {0} not found")]
    ConversationNotFound(String),

    #[error("User {user} does not own conversation {conversation}")]
    Forbidden { user: String, conversation: String },

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Fallback storage failed: {0}")]
    Fallback(#[from] std::io::Error),

    #[error("Failed to encode stored messages: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
