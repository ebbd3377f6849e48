use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::{debug, info};

use quark_bus::EventBus;
use quark_core::time::to_chrono;
use quark_core::{
    Clock, Collection, DocumentStore, HealthCheckResult, KeyValueStore, ModuleRecord, ServiceHealth, ServiceRecord,
    ServiceRegistration, ServiceStatus, ServiceType, validate_token,
};

use crate::error::{RegistryError, RegistryResult};

/// What `heartbeat` does with an id the registry has never seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownHeartbeatPolicy {
    /// Succeed without effect, so callers cannot probe which ids exist.
    #[default]
    Ignore,
    Reject,
}

impl std::str::FromStr for UnknownHeartbeatPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "reject" => Ok(Self::Reject),
            other => Err(format!("expected 'ignore' or 'reject', got '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub unknown_heartbeat: UnknownHeartbeatPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub error: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub by_type: BTreeMap<String, usize>,
}

/// Authoritative store of services and modules.
///
/// Every operation is a handful of single-key reads and writes against the
/// shared [`KeyValueStore`]. Concurrent writers to the same id race under
/// last-write-wins.
pub struct Registry {
    store: Arc<dyn KeyValueStore>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
}

impl Registry {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            config,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // Services

    /// Upserts a service and publishes `service.registered`.
    ///
    /// Re-registering keeps the original `registeredAt` and the
    /// monitor-owned health flag, and never moves `lastHeartbeat` backwards.
    pub async fn register_service(&self, registration: ServiceRegistration) -> RegistryResult<ServiceRecord> {
        let missing = registration.missing_fields();
        let Some(kind) = registration.kind.filter(|_| missing.is_empty()) else {
            return Err(RegistryError::Validation(missing));
        };

        let now = self.clock.now();
        let existing: Option<ServiceRecord> = self.store.get_doc(Collection::Services, &registration.id)?;

        let mut record = ServiceRecord {
            id: registration.id,
            name: registration.name,
            version: if registration.version.trim().is_empty() {
                "1.0.0".to_string()
            } else {
                registration.version
            },
            kind,
            endpoint: registration.endpoint,
            port: registration.port,
            status: registration.status.unwrap_or_default(),
            health: ServiceHealth::Unknown,
            last_heartbeat: now,
            registered_at: now,
            metadata: registration.metadata,
            dependencies: registration.dependencies,
            resources: registration.resources,
        };
        if let Some(previous) = &existing {
            record.registered_at = previous.registered_at;
            record.health = previous.health;
            record.update_heartbeat(previous.last_heartbeat);
        }

        self.store.put_doc(Collection::Services, &record.id, &record)?;
        metrics::counter!("quark_registry_registrations_total").increment(1);
        info!(
            service_id = %record.id,
            name = %record.name,
            kind = %record.kind,
            replaced = existing.is_some(),
            "service registered"
        );

        self.bus.publish_service_registered(&record).await?;
        Ok(record)
    }

    /// Refreshes `lastHeartbeat`. Returns whether the service exists.
    pub fn heartbeat(&self, id: &str) -> RegistryResult<bool> {
        let now = self.clock.now();
        let updated: Option<ServiceRecord> = self.store.update_doc(Collection::Services, id, |service: &mut ServiceRecord| {
            service.update_heartbeat(now);
            true
        })?;
        if updated.is_none() {
            return match self.config.unknown_heartbeat {
                UnknownHeartbeatPolicy::Ignore => {
                    debug!(service_id = %id, "heartbeat for unknown service ignored");
                    Ok(false)
                }
                UnknownHeartbeatPolicy::Reject => Err(RegistryError::service_not_found(id)),
            };
        }

        debug!(service_id = %id, "heartbeat recorded");
        Ok(true)
    }

    /// Sets the operational status. Leaves `lastHeartbeat` alone so the
    /// monitor marking a service as failed cannot keep it alive.
    pub fn update_status(&self, id: &str, status: ServiceStatus) -> RegistryResult<bool> {
        let updated: Option<ServiceRecord> = self.store.update_doc(Collection::Services, id, |service: &mut ServiceRecord| {
            if service.status == status {
                return false;
            }
            service.status = status;
            true
        })?;
        if updated.is_some() {
            debug!(service_id = %id, ?status, "service status updated");
        }
        Ok(updated.is_some())
    }

    /// Removes the service and its health entry, then publishes
    /// `service.unregistered`. Unknown ids are a no-op.
    pub async fn unregister_service(&self, id: &str) -> RegistryResult<bool> {
        let removed = self.store.delete(Collection::Services, id)?;
        self.store.delete(Collection::Health, id)?;
        if !removed {
            return Ok(false);
        }

        info!(service_id = %id, "service unregistered");
        self.bus.publish_service_unregistered(id).await?;
        Ok(true)
    }

    pub fn get_service(&self, id: &str) -> RegistryResult<Option<ServiceRecord>> {
        Ok(self.store.get_doc(Collection::Services, id)?)
    }

    pub fn all_services(&self) -> RegistryResult<Vec<ServiceRecord>> {
        Ok(self.store.all_docs(Collection::Services)?)
    }

    pub fn services_by_type(&self, kind: ServiceType) -> RegistryResult<Vec<ServiceRecord>> {
        let mut services = self.all_services()?;
        services.retain(|s| s.kind == kind);
        Ok(services)
    }

    /// Case-insensitive regex match over id, name and type. A pattern that is
    /// not a valid regex is matched as a literal substring.
    pub fn find_by_pattern(&self, pattern: &str) -> RegistryResult<Vec<ServiceRecord>> {
        let Some(regex) = search_regex(pattern) else {
            return Ok(Vec::new());
        };
        let mut services = self.all_services()?;
        services.retain(|s| regex.is_match(&s.id) || regex.is_match(&s.name) || regex.is_match(s.kind.as_str()));
        Ok(services)
    }

    /// Services whose last heartbeat is older than `timeout`.
    pub fn stale_services(&self, timeout: Duration) -> RegistryResult<Vec<ServiceRecord>> {
        let now = self.clock.now();
        let timeout = to_chrono(timeout);
        let mut services = self.all_services()?;
        services.retain(|s| s.since_heartbeat(now) > timeout);
        Ok(services)
    }

    /// Stores the latest check result and mirrors its flag onto the service.
    ///
    /// Two separate writes: between them a reader can see the new health
    /// document next to the old service flag. A result for an id that was
    /// removed meanwhile leaves an orphan health document and nothing else.
    pub fn update_health(&self, result: &HealthCheckResult) -> RegistryResult<()> {
        self.store.put_doc(Collection::Health, &result.service_id, result)?;

        let health = result.status.as_service_health();
        let updated: Option<ServiceRecord> =
            self.store
                .update_doc(Collection::Services, &result.service_id, |service: &mut ServiceRecord| {
                    if service.health == health {
                        return false;
                    }
                    service.set_health(health);
                    true
                })?;
        if updated.is_none() {
            debug!(service_id = %result.service_id, "health written for missing service");
        }
        Ok(())
    }

    pub fn get_health(&self, id: &str) -> RegistryResult<Option<HealthCheckResult>> {
        Ok(self.store.get_doc(Collection::Health, id)?)
    }

    pub fn all_health(&self) -> RegistryResult<Vec<HealthCheckResult>> {
        Ok(self.store.all_docs(Collection::Health)?)
    }

    /// Full scan. The dataset is small enough that nothing is indexed.
    pub fn service_stats(&self) -> RegistryResult<ServiceStats> {
        let services = self.all_services()?;
        let mut stats = ServiceStats {
            total: services.len(),
            ..Default::default()
        };

        for service in &services {
            match service.status {
                ServiceStatus::Active => stats.active += 1,
                ServiceStatus::Inactive => stats.inactive += 1,
                ServiceStatus::Error => stats.error += 1,
            }
            match service.health {
                ServiceHealth::Healthy => stats.healthy += 1,
                ServiceHealth::Unhealthy => stats.unhealthy += 1,
                ServiceHealth::Unknown | ServiceHealth::Stale => stats.unknown += 1,
            }
            *stats.by_type.entry(service.kind.to_string()).or_insert(0) += 1;
        }

        metrics::gauge!("quark_registry_services").set(stats.total as f64);
        Ok(stats)
    }

    // Modules

    /// Upserts a module and publishes `module.registered` on the module's own
    /// subject.
    pub async fn register_module(&self, mut module: ModuleRecord) -> RegistryResult<ModuleRecord> {
        let missing = module.missing_fields();
        if !missing.is_empty() {
            return Err(RegistryError::Validation(missing));
        }
        validate_token(&module.id).map_err(RegistryError::InvalidModuleId)?;

        let existing: Option<ModuleRecord> = self.store.get_doc(Collection::Modules, &module.id)?;
        module.registered_at = existing
            .and_then(|m| m.registered_at)
            .or_else(|| Some(self.clock.now()));

        self.store.put_doc(Collection::Modules, &module.id, &module)?;
        info!(module_id = %module.id, version = %module.version, "module registered");

        self.bus.publish_module_registered(&module).await?;
        Ok(module)
    }

    pub fn get_module(&self, id: &str) -> RegistryResult<Option<ModuleRecord>> {
        Ok(self.store.get_doc(Collection::Modules, id)?)
    }

    pub fn all_modules(&self) -> RegistryResult<Vec<ModuleRecord>> {
        Ok(self.store.all_docs(Collection::Modules)?)
    }

    /// Modules are never expired; this is the only way one goes away.
    pub async fn unregister_module(&self, id: &str) -> RegistryResult<bool> {
        let Some(module) = self.get_module(id)? else {
            return Ok(false);
        };
        self.store.delete(Collection::Modules, id)?;

        info!(module_id = %id, "module unregistered");
        self.bus.publish_module_unregistered(id, &module.version).await?;
        Ok(true)
    }
}

fn search_regex(pattern: &str) -> Option<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .or_else(|_| RegexBuilder::new(&regex::escape(pattern)).case_insensitive(true).build())
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, VanishingStore};
    use quark_bus::{HistoryQuery, kinds};
    use quark_core::{HealthStatus, ModuleRuntime, ModuleType, RuntimeEngine};

    #[tokio::test]
    async fn register_requires_id_name_and_type() {
        let h = Harness::new();
        let err = h
            .registry
            .register_service(ServiceRegistration::default())
            .await
            .unwrap_err();

        match err {
            RegistryError::Validation(fields) => assert_eq!(fields, vec!["id", "name", "type"]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(h.registry.all_services().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reregistering_overwrites_single_record() {
        let h = Harness::new();
        h.register("svc-1", "first").await;
        h.clock.advance_secs(10);
        h.register("svc-1", "second").await;

        let all = h.registry.all_services().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "second");
        assert_eq!(all[0].registered_at, h.start);
        assert_eq!(all[0].last_heartbeat, h.start + chrono::Duration::seconds(10));
    }

    #[tokio::test]
    async fn registration_publishes_event() {
        let h = Harness::new();
        h.register("svc-1", "auth").await;

        let events = h
            .bus
            .event_history("service.registered", &HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, kinds::SERVICE_REGISTERED);
        assert_eq!(events[0].data["id"], "svc-1");
    }

    #[tokio::test]
    async fn new_service_starts_unknown() {
        let h = Harness::new();
        let record = h.register("svc-1", "auth").await;
        assert_eq!(record.health, ServiceHealth::Unknown);
        assert_eq!(record.status, ServiceStatus::Active);
        assert_eq!(record.version, "1.0.0");
    }

    #[tokio::test]
    async fn heartbeat_moves_forward() {
        let h = Harness::new();
        h.register("svc-1", "auth").await;
        h.clock.advance_secs(5);

        assert!(h.registry.heartbeat("svc-1").unwrap());
        let service = h.registry.get_service("svc-1").unwrap().unwrap();
        assert!(service.last_heartbeat >= service.registered_at);
        assert_eq!(service.last_heartbeat, h.start + chrono::Duration::seconds(5));
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_id_follows_policy() {
        let h = Harness::new();
        assert!(!h.registry.heartbeat("ghost").unwrap());
        assert!(h.registry.get_service("ghost").unwrap().is_none());

        let strict = Harness::with_config(RegistryConfig {
            unknown_heartbeat: UnknownHeartbeatPolicy::Reject,
        });
        let err = strict.registry.heartbeat("ghost").unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn status_update_keeps_heartbeat() {
        let h = Harness::new();
        h.register("svc-1", "auth").await;
        h.clock.advance_secs(30);

        assert!(h.registry.update_status("svc-1", ServiceStatus::Inactive).unwrap());
        assert!(!h.registry.update_status("ghost", ServiceStatus::Inactive).unwrap());

        let service = h.registry.get_service("svc-1").unwrap().unwrap();
        assert_eq!(service.status, ServiceStatus::Inactive);
        assert_eq!(service.last_heartbeat, h.start);
    }

    #[tokio::test]
    async fn unregister_removes_health_and_publishes_once() {
        let h = Harness::new();
        h.register("svc-1", "auth").await;
        h.registry
            .update_health(&HealthCheckResult::new("svc-1", HealthStatus::Healthy, h.start))
            .unwrap();

        assert!(h.registry.unregister_service("svc-1").await.unwrap());
        assert!(!h.registry.unregister_service("svc-1").await.unwrap());

        assert!(h.registry.get_service("svc-1").unwrap().is_none());
        assert!(h.registry.get_health("svc-1").unwrap().is_none());
        let events = h
            .bus
            .event_history("service.unregistered", &HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["serviceId"], "svc-1");
    }

    #[tokio::test]
    async fn queries_by_type_and_pattern() {
        let h = Harness::new();
        h.register("svc-auth", "Auth Gateway").await;
        h.registry
            .register_service(ServiceRegistration::new("svc-mail", "Mailer", ServiceType::Notification))
            .await
            .unwrap();

        let apis = h.registry.services_by_type(ServiceType::Api).unwrap();
        assert_eq!(apis.len(), 1);
        assert_eq!(apis[0].id, "svc-auth");

        let found = h.registry.find_by_pattern("gateway").unwrap();
        assert_eq!(found.len(), 1);

        let by_type = h.registry.find_by_pattern("^notif").unwrap();
        assert_eq!(by_type[0].id, "svc-mail");

        // not a valid regex, matched literally
        assert!(h.registry.find_by_pattern("svc-(").unwrap().is_empty());
        assert_eq!(h.registry.find_by_pattern("SVC-").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stale_services_use_strict_threshold() {
        let h = Harness::new();
        h.register("svc-1", "auth").await;

        h.clock.advance_secs(300);
        assert!(h.registry.stale_services(Duration::from_secs(300)).unwrap().is_empty());

        h.clock.advance_secs(1);
        assert_eq!(h.registry.stale_services(Duration::from_secs(300)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_health_denormalizes_flag() {
        let h = Harness::new();
        h.register("svc-1", "auth").await;

        let result = HealthCheckResult::new("svc-1", HealthStatus::Degraded, h.start).with_warning("slow");
        h.registry.update_health(&result).unwrap();

        let service = h.registry.get_service("svc-1").unwrap().unwrap();
        assert_eq!(service.health, ServiceHealth::Unhealthy);
        assert_eq!(h.registry.get_health("svc-1").unwrap(), Some(result));

        let orphan = HealthCheckResult::new("gone", HealthStatus::Healthy, h.start);
        h.registry.update_health(&orphan).unwrap();
        assert!(h.registry.get_service("gone").unwrap().is_none());
        assert_eq!(h.registry.all_health().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stats_count_by_status_health_and_type() {
        let h = Harness::new();
        h.register("a", "a").await;
        h.register("b", "b").await;
        h.registry
            .register_service(ServiceRegistration::new("c", "c", ServiceType::Storage))
            .await
            .unwrap();
        h.registry.update_status("b", ServiceStatus::Error).unwrap();
        h.registry
            .update_health(&HealthCheckResult::new("a", HealthStatus::Healthy, h.start))
            .unwrap();

        let stats = h.registry.service_stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.error, 1);
        assert_eq!(stats.healthy, 1);
        assert_eq!(stats.unknown, 2);
        assert_eq!(stats.by_type.get("api"), Some(&2));
        assert_eq!(stats.by_type.get("storage"), Some(&1));
    }

    #[tokio::test]
    async fn modules_have_explicit_lifecycle() {
        let h = Harness::new();
        let module = ModuleRecord::new(
            "blog",
            "Blog",
            "2.1.0",
            ModuleType::Service,
            ModuleRuntime::new(RuntimeEngine::Docker, "node server.js"),
        );

        let stored = h.registry.register_module(module).await.unwrap();
        assert_eq!(stored.registered_at, Some(h.start));
        assert_eq!(h.registry.all_modules().unwrap().len(), 1);

        h.clock.advance_secs(3600);
        assert!(h.registry.stale_services(Duration::from_secs(300)).unwrap().is_empty());
        assert!(h.registry.get_module("blog").unwrap().is_some());

        assert!(h.registry.unregister_module("blog").await.unwrap());
        assert!(!h.registry.unregister_module("blog").await.unwrap());

        let events = h
            .bus
            .event_history("module.blog.>", &HistoryQuery::default())
            .await
            .unwrap();
        let seen: Vec<_> = events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(seen, vec![kinds::MODULE_REGISTERED, kinds::MODULE_UNREGISTERED]);
    }

    #[tokio::test]
    async fn module_without_entrypoint_is_rejected() {
        let h = Harness::new();
        let module = ModuleRecord::new(
            "blog",
            "Blog",
            "1.0.0",
            ModuleType::Wasm,
            ModuleRuntime::new(RuntimeEngine::Wasm, ""),
        );
        let err = h.registry.register_module(module).await.unwrap_err();
        assert!(matches!(err, RegistryError::Validation(f) if f == vec!["runtime.entrypoint"]));
    }

    #[tokio::test]
    async fn module_id_must_be_one_subject_token() {
        let h = Harness::new();
        for id in ["acme.blog", "my blog", "blog.*", ">"] {
            let module = ModuleRecord::new(
                id,
                "Blog",
                "1.0.0",
                ModuleType::Wasm,
                ModuleRuntime::new(RuntimeEngine::Wasm, "blog.wasm"),
            );
            let err = h.registry.register_module(module).await.unwrap_err();
            assert!(matches!(err, RegistryError::InvalidModuleId(_)), "{id}");
            assert!(h.registry.get_module(id).unwrap().is_none(), "{id}");
        }

        assert!(h.registry.all_modules().unwrap().is_empty());
        let events = h.bus.event_history("module.>", &HistoryQuery::default()).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn concurrent_unregister_is_not_undone() {
        let store = VanishingStore::new();
        let h = Harness::with_store(store.clone());
        for id in ["svc-1", "svc-2", "svc-3"] {
            h.register(id, id).await;
        }
        store.arm();

        assert!(!h.registry.heartbeat("svc-1").unwrap());
        assert!(!h.registry.update_status("svc-2", ServiceStatus::Error).unwrap());
        h.registry
            .update_health(&HealthCheckResult::new("svc-3", HealthStatus::Unhealthy, h.start))
            .unwrap();

        assert!(store.all(Collection::Services).unwrap().is_empty());
    }
}
