use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::service::ServiceHealth;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
}

impl HealthStatus {
    /// The flag denormalized onto the service record. Degraded counts as unhealthy.
    pub fn as_service_health(&self) -> ServiceHealth {
        match self {
            HealthStatus::Healthy => ServiceHealth::Healthy,
            HealthStatus::Unhealthy | HealthStatus::Degraded => ServiceHealth::Unhealthy,
        }
    }
}

/// Latest check outcome for one service. Only the most recent result per id is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub service_id: String,
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    /// Probe round trip in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<u64>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl HealthCheckResult {
    pub fn new(service_id: impl Into<String>, status: HealthStatus, timestamp: DateTime<Utc>) -> Self {
        Self {
            service_id: service_id.into(),
            status,
            timestamp,
            response_time: None,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn with_response_time(mut self, millis: u64) -> Self {
        self.response_time = Some(millis);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.errors.push(error.into());
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
