//! Convenience wrappers that build well-formed events and hand them to
//! [`EventBus::publish`]. They add no delivery semantics of their own.
//!
//! Service events go out on `service.<action>`. Module events go out on
//! `module.<moduleId>.<action>` so a subscriber can follow one module.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use quark_core::{Event, HUB_SOURCE, ModuleRecord, ServiceHealth, ServiceRecord, validate_token};

use crate::bus::EventBus;
use crate::error::BusResult;

pub mod kinds {
    pub const SERVICE_REGISTERED: &str = "service.registered";
    pub const SERVICE_UNREGISTERED: &str = "service.unregistered";
    pub const SERVICE_HEALTH_CHANGED: &str = "service.health.changed";
    pub const MODULE_REGISTERED: &str = "module.registered";
    pub const MODULE_UNREGISTERED: &str = "module.unregistered";
    pub const MODULE_DEPLOYED: &str = "module.deployed";
    pub const MODULE_STARTED: &str = "module.started";
    pub const MODULE_STOPPED: &str = "module.stopped";
    pub const MODULE_ERROR: &str = "module.error";
}

/// Payload of `service.health.changed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthChange {
    pub service_id: String,
    pub status: ServiceHealth,
    /// True only for an unhealthy to healthy transition.
    pub recovered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl HealthChange {
    pub fn new(service_id: impl Into<String>, status: ServiceHealth, recovered: bool) -> Self {
        Self {
            service_id: service_id.into(),
            status,
            recovered,
            details: None,
        }
    }

    pub fn stale(service_id: impl Into<String>) -> Self {
        Self::new(service_id, ServiceHealth::Stale, false)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl EventBus {
    pub async fn publish_service_event(&self, action: &str, data: Value) -> BusResult<Event> {
        let event = Event::new(format!("service.{action}"), HUB_SOURCE, data);
        self.publish(&event.kind, &event).await?;
        Ok(event)
    }

    pub async fn publish_module_event(
        &self,
        module_id: &str,
        version: &str,
        action: &str,
        data: Value,
    ) -> BusResult<Event> {
        validate_token(module_id)?;
        let event = Event::module(format!("module.{action}"), module_id, version, data);
        self.publish(&format!("module.{module_id}.{action}"), &event).await?;
        Ok(event)
    }

    pub async fn publish_system_event(&self, action: &str, data: Value) -> BusResult<Event> {
        let event = Event::new(format!("system.{action}"), HUB_SOURCE, data);
        self.publish(&event.kind, &event).await?;
        Ok(event)
    }

    pub async fn publish_service_registered(&self, service: &ServiceRecord) -> BusResult<Event> {
        self.publish_service_event("registered", serde_json::to_value(service)?)
            .await
    }

    pub async fn publish_service_unregistered(&self, service_id: &str) -> BusResult<Event> {
        self.publish_service_event("unregistered", json!({ "serviceId": service_id }))
            .await
    }

    pub async fn publish_service_health_changed(&self, change: &HealthChange) -> BusResult<Event> {
        self.publish_service_event("health.changed", serde_json::to_value(change)?)
            .await
    }

    pub async fn publish_module_registered(&self, module: &ModuleRecord) -> BusResult<Event> {
        let data = serde_json::to_value(module)?;
        self.publish_module_event(&module.id, &module.version, "registered", data)
            .await
    }

    pub async fn publish_module_unregistered(&self, module_id: &str, version: &str) -> BusResult<Event> {
        self.publish_module_event(module_id, version, "unregistered", json!({ "moduleId": module_id }))
            .await
    }

    pub async fn publish_module_deployed(&self, module_id: &str, version: &str, data: Value) -> BusResult<Event> {
        self.publish_module_event(module_id, version, "deployed", data).await
    }

    pub async fn publish_module_started(&self, module_id: &str, version: &str, data: Value) -> BusResult<Event> {
        self.publish_module_event(module_id, version, "started", data).await
    }

    pub async fn publish_module_stopped(&self, module_id: &str, version: &str, data: Value) -> BusResult<Event> {
        self.publish_module_event(module_id, version, "stopped", data).await
    }

    pub async fn publish_module_error(&self, module_id: &str, version: &str, error: &str) -> BusResult<Event> {
        self.publish_module_event(module_id, version, "error", json!({ "error": error }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::StreamConfig;
    use crate::error::BusError;
    use crate::bus::{BusConfig, HistoryQuery};
    use crate::memory::MemoryBroker;
    use std::sync::Arc;

    fn bus() -> EventBus {
        EventBus::new(
            Arc::new(MemoryBroker::connected(StreamConfig::default())),
            BusConfig::default(),
        )
    }

    #[tokio::test]
    async fn health_change_payload_shape() {
        let bus = bus();
        let change = HealthChange::new("svc-1", ServiceHealth::Healthy, true);
        let event = bus.publish_service_health_changed(&change).await.unwrap();

        assert_eq!(event.kind, kinds::SERVICE_HEALTH_CHANGED);
        assert_eq!(event.source, HUB_SOURCE);
        assert_eq!(
            event.data,
            json!({ "serviceId": "svc-1", "status": "healthy", "recovered": true })
        );
    }

    #[tokio::test]
    async fn module_events_carry_module_subject() {
        let bus = bus();
        bus.publish_module_deployed("blog", "2.1.0", json!({ "replicas": 1 }))
            .await
            .unwrap();
        bus.publish_module_error("shop", "1.0.0", "crashed").await.unwrap();

        let blog = bus
            .event_history("module.blog.>", &HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(blog.len(), 1);
        assert_eq!(blog[0].kind, kinds::MODULE_DEPLOYED);
        assert_eq!(blog[0].source, "module:blog");
        assert!(blog[0].is_module_event());

        let errors = bus
            .event_history("module.*.error", &HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].data["error"], "crashed");
    }

    #[tokio::test]
    async fn dotted_module_id_is_not_published() {
        let bus = bus();
        let err = bus
            .publish_module_started("acme.blog", "1.0.0", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidSubject(_)));

        let leaked = bus
            .event_history("module.acme.>", &HistoryQuery::default())
            .await
            .unwrap();
        assert!(leaked.is_empty());
    }

    #[tokio::test]
    async fn lifecycle_events_keep_order_per_module() {
        let bus = bus();
        bus.publish_module_started("blog", "2.1.0", json!({ "pid": 42 })).await.unwrap();
        bus.publish_module_stopped("blog", "2.1.0", json!({ "exitCode": 0 })).await.unwrap();

        let seen: Vec<String> = bus
            .event_history("module.blog.*", &HistoryQuery::default())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(seen, vec![kinds::MODULE_STARTED, kinds::MODULE_STOPPED]);
    }
}
