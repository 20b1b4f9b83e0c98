//! Error types for the policy engine

use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the engine components.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("secondary model error: {0}")]
    SecondaryModel(String),

    #[error("malformed conversation: {0}")]
    MalformedConversation(String),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;
