use quark_core::SubjectError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus not connected")]
    NotConnected,

    #[error(transparent)]
    InvalidSubject(#[from] SubjectError),

    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid durable consumer name '{0}'")]
    InvalidDurable(String),

    #[error("durable consumer '{0}' not found")]
    ConsumerNotFound(String),

    #[error("durable consumer '{durable}' is bound to '{existing}', not '{requested}'")]
    ConsumerConflict {
        durable: String,
        existing: String,
        requested: String,
    },

    #[error("broker error: {0}")]
    Broker(String),
}

pub type BusResult<T> = Result<T, BusError>;
