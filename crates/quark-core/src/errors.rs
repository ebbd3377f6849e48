use thiserror::Error;

use crate::store::Collection;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("corrupt {collection} document {id}: {source}")]
    Corrupt {
        collection: Collection,
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubjectError {
    #[error("invalid subject '{subject}': {reason}")]
    InvalidSubject { subject: String, reason: String },

    #[error("invalid subject pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}
