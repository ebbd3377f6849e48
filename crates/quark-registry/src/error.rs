use std::time::Duration;

use quark_bus::BusError;
use quark_core::{StoreError, SubjectError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("missing required fields: {}", .0.join(", "))]
    Validation(Vec<&'static str>),

    /// Module ids become one token of `module.<id>.<action>`.
    #[error("invalid module id: {0}")]
    InvalidModuleId(SubjectError),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl RegistryError {
    pub fn service_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "service",
            id: id.into(),
        }
    }

    pub fn module_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "module",
            id: id.into(),
        }
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Outbound liveness probe failure. The monitor turns these into a
/// heartbeat-freshness fallback and never propagates them.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("probe transport error: {0}")]
    Transport(String),

    #[error("probe returned HTTP {0}")]
    Status(u16),
}
