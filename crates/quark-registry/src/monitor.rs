//! Periodic liveness evaluation. A fast health tick re-checks every service
//! and a slow stale sweep removes the ones that stopped heartbeating.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use quark_bus::HealthChange;
use quark_core::time::to_chrono;
use quark_core::{HealthCheckResult, HealthStatus, ServiceHealth, ServiceRecord, ServiceStatus};

use crate::error::{RegistryError, RegistryResult};
use crate::probe::Prober;
use crate::registry::Registry;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub check_interval: Duration,
    pub sweep_interval: Duration,
    /// Beyond this a service is unhealthy without probing.
    pub heartbeat_timeout: Duration,
    /// Window a heartbeat must fall in when no successful probe vouches for
    /// the service.
    pub heartbeat_freshness: Duration,
    /// Beyond this the sweep removes the service.
    pub stale_timeout: Duration,
    pub probe_timeout: Duration,
    pub max_concurrent_probes: usize,
    pub probe_path: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(300),
            heartbeat_timeout: Duration::from_secs(60),
            heartbeat_freshness: Duration::from_secs(30),
            stale_timeout: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(5),
            max_concurrent_probes: 16,
            probe_path: "/health".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Services whose result could not be recorded or announced.
    pub failed: usize,
    pub transitions: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub removed: Vec<String>,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub total_services: usize,
    pub healthy_services: usize,
    pub unhealthy_services: usize,
    /// Services without any recorded check.
    pub unknown_services: usize,
    pub services: BTreeMap<String, HealthCheckResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringStats {
    pub is_running: bool,
    pub check_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub ticks: u64,
    pub sweeps: u64,
    pub last_tick: Option<DateTime<Utc>>,
    pub last_sweep: Option<DateTime<Utc>>,
    pub removed_total: u64,
}

#[derive(Default)]
struct Counters {
    ticks: u64,
    sweeps: u64,
    last_tick: Option<DateTime<Utc>>,
    last_sweep: Option<DateTime<Utc>>,
    removed_total: u64,
}

struct Running {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct Inner {
    registry: Arc<Registry>,
    prober: Arc<dyn Prober>,
    config: RwLock<MonitorConfig>,
    counters: Mutex<Counters>,
}

/// Owns its timers; one instance per process. Nothing is global.
pub struct HealthMonitor {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<Registry>, prober: Arc<dyn Prober>, config: MonitorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                prober,
                config: RwLock::new(config),
                counters: Mutex::new(Counters::default()),
            }),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> MonitorConfig {
        self.inner.config()
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Starts both timers. The first tick fires one interval from now.
    pub fn start(&self) {
        let mut running = self.running();
        if running.is_some() {
            warn!("health monitor is already running");
            return;
        }

        let config = self.inner.config();
        let token = CancellationToken::new();
        let handles = vec![
            tokio::spawn(health_loop(self.inner.clone(), config.check_interval, token.clone())),
            tokio::spawn(sweep_loop(self.inner.clone(), config.sweep_interval, token.clone())),
        ];
        *running = Some(Running { token, handles });

        info!(
            check_interval = ?config.check_interval,
            sweep_interval = ?config.sweep_interval,
            "health monitor started"
        );
    }

    /// Stops both timers and waits for a tick or sweep in progress.
    pub async fn stop(&self) {
        let Some(running) = self.running().take() else {
            return;
        };
        running.token.cancel();
        for handle in running.handles {
            if let Err(err) = handle.await {
                error!(error = %err, "health monitor task failed");
            }
        }
        info!("health monitor stopped");
    }

    pub async fn set_check_interval(&self, interval: Duration) {
        self.inner.write_config().check_interval = interval;
        self.restart_if_running().await;
    }

    pub async fn set_sweep_interval(&self, interval: Duration) {
        self.inner.write_config().sweep_interval = interval;
        self.restart_if_running().await;
    }

    async fn restart_if_running(&self) {
        if self.is_running() {
            self.stop().await;
            self.start();
        }
    }

    pub async fn run_health_tick(&self) -> RegistryResult<TickReport> {
        self.inner.run_health_tick().await
    }

    pub async fn run_stale_sweep(&self) -> RegistryResult<SweepReport> {
        self.inner.run_stale_sweep().await
    }

    /// On-demand check of one service, outside the timers. `None` if the id
    /// is unknown.
    pub async fn check_service(&self, id: &str) -> RegistryResult<Option<HealthCheckResult>> {
        let Some(service) = self.inner.registry.get_service(id)? else {
            return Ok(None);
        };
        let config = self.inner.config();
        let result = self.inner.evaluate(&service, &config).await;
        self.inner.record(&service, &result).await?;
        Ok(Some(result))
    }

    pub fn health_summary(&self) -> RegistryResult<HealthSummary> {
        let registry = &self.inner.registry;
        let services = registry.all_services()?;
        let checks: BTreeMap<String, HealthCheckResult> = registry
            .all_health()?
            .into_iter()
            .map(|result| (result.service_id.clone(), result))
            .collect();

        let mut summary = HealthSummary {
            total_services: services.len(),
            ..Default::default()
        };
        for service in &services {
            match checks.get(&service.id) {
                None => summary.unknown_services += 1,
                Some(check) if check.is_healthy() => summary.healthy_services += 1,
                Some(_) => summary.unhealthy_services += 1,
            }
        }
        summary.services = checks;
        Ok(summary)
    }

    pub fn monitoring_stats(&self) -> MonitoringStats {
        let config = self.inner.config();
        let counters = self.inner.counters();
        MonitoringStats {
            is_running: self.is_running(),
            check_interval_secs: config.check_interval.as_secs(),
            sweep_interval_secs: config.sweep_interval.as_secs(),
            ticks: counters.ticks,
            sweeps: counters.sweeps,
            last_tick: counters.last_tick,
            last_sweep: counters.last_sweep,
            removed_total: counters.removed_total,
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(running) = self.running().take() {
            running.token.cancel();
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn health_loop(inner: Arc<Inner>, period: Duration, token: CancellationToken) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(err) = inner.run_health_tick().await {
            error!(error = %err, "health tick failed");
        }
    }
}

async fn sweep_loop(inner: Arc<Inner>, period: Duration, token: CancellationToken) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(err) = inner.run_stale_sweep().await {
            error!(error = %err, "stale sweep failed");
        }
    }
}

enum Checked {
    Recorded { healthy: bool, transitioned: bool },
    Failed,
}

impl Inner {
    fn config(&self) -> MonitorConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn write_config(&self) -> std::sync::RwLockWriteGuard<'_, MonitorConfig> {
        self.config.write().unwrap_or_else(|e| e.into_inner())
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run_health_tick(&self) -> RegistryResult<TickReport> {
        let config = self.config();
        let services = self.registry.all_services()?;
        let mut report = TickReport {
            checked: services.len(),
            ..Default::default()
        };

        let outcomes: Vec<Checked> = futures::stream::iter(services)
            .map(|service| self.check_one(service, &config))
            .buffer_unordered(config.max_concurrent_probes.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Checked::Recorded { healthy, transitioned } => {
                    if healthy {
                        report.healthy += 1;
                    } else {
                        report.unhealthy += 1;
                    }
                    if transitioned {
                        report.transitions += 1;
                    }
                }
                Checked::Failed => report.failed += 1,
            }
        }

        {
            let mut counters = self.counters();
            counters.ticks += 1;
            counters.last_tick = Some(self.registry.clock().now());
        }
        metrics::gauge!("quark_registry_services").set(report.checked as f64);
        debug!(
            checked = report.checked,
            healthy = report.healthy,
            unhealthy = report.unhealthy,
            failed = report.failed,
            "health tick complete"
        );
        Ok(report)
    }

    async fn check_one(&self, service: ServiceRecord, config: &MonitorConfig) -> Checked {
        let result = self.evaluate(&service, config).await;
        match self.record(&service, &result).await {
            Ok(change) => Checked::Recorded {
                healthy: result.is_healthy(),
                transitioned: change.is_some(),
            },
            Err(err) => {
                error!(service_id = %service.id, error = %err, "failed to record health result");
                Checked::Failed
            }
        }
    }

    async fn evaluate(&self, service: &ServiceRecord, config: &MonitorConfig) -> HealthCheckResult {
        let now = self.registry.clock().now();
        let since = service.since_heartbeat(now);
        let fresh = since < to_chrono(config.heartbeat_freshness);

        let result = if since > to_chrono(config.heartbeat_timeout) {
            HealthCheckResult::new(&service.id, HealthStatus::Unhealthy, now)
                .with_error(format!("no heartbeat for {}s", since.num_seconds()))
        } else if let Some(endpoint) = &service.endpoint {
            let probe = tokio::time::timeout(config.probe_timeout, self.prober.probe(endpoint)).await;
            match probe {
                Ok(Ok(round_trip)) => HealthCheckResult::new(&service.id, HealthStatus::Healthy, now)
                    .with_response_time(round_trip.as_millis() as u64),
                Ok(Err(err)) => fallback(service, now, fresh, err.to_string()),
                Err(_) => fallback(
                    service,
                    now,
                    fresh,
                    format!("probe timed out after {:?}", config.probe_timeout),
                ),
            }
        } else if fresh {
            HealthCheckResult::new(&service.id, HealthStatus::Healthy, now)
        } else {
            HealthCheckResult::new(&service.id, HealthStatus::Unhealthy, now)
                .with_error(format!("heartbeat {}s old", since.num_seconds()))
        };

        let outcome = if result.is_healthy() { "healthy" } else { "unhealthy" };
        metrics::counter!("quark_health_checks_total", "outcome" => outcome).increment(1);
        result
    }

    /// Announces a change of the health flag, then writes the result and
    /// adjusts the operational status. When the announcement fails nothing is
    /// written, so the next check sees the same transition and retries it.
    async fn record(&self, service: &ServiceRecord, result: &HealthCheckResult) -> RegistryResult<Option<HealthChange>> {
        let previous = service.health;
        let current = result.status.as_service_health();

        let change = if previous == current {
            None
        } else {
            let recovered = previous == ServiceHealth::Unhealthy && current == ServiceHealth::Healthy;
            let change = HealthChange::new(&service.id, current, recovered).with_details(json!({
                "responseTime": result.response_time,
                "errors": result.errors,
                "warnings": result.warnings,
            }));
            self.registry.bus().publish_service_health_changed(&change).await?;
            Some(change)
        };

        self.registry.update_health(result)?;
        match current {
            ServiceHealth::Unhealthy => {
                self.registry.update_status(&service.id, ServiceStatus::Error)?;
            }
            ServiceHealth::Healthy if service.status == ServiceStatus::Error => {
                self.registry.update_status(&service.id, ServiceStatus::Active)?;
            }
            _ => {}
        }

        if let Some(change) = &change {
            metrics::counter!("quark_health_transitions_total", "to" => current.as_str()).increment(1);
            info!(
                service_id = %service.id,
                from = %previous,
                to = %current,
                recovered = change.recovered,
                "service health changed"
            );
        }
        Ok(change)
    }

    async fn run_stale_sweep(&self) -> RegistryResult<SweepReport> {
        let config = self.config();
        let stale = self.registry.stale_services(config.stale_timeout)?;
        let mut report = SweepReport::default();

        for service in stale {
            let change = HealthChange::stale(&service.id).with_details(json!({
                "reason": "No heartbeat received",
                "lastSeen": service.last_heartbeat,
            }));
            if let Err(err) = self.registry.bus().publish_service_health_changed(&change).await {
                error!(service_id = %service.id, error = %err, "could not announce stale service, keeping it");
                report.failed += 1;
                continue;
            }

            match self.registry.unregister_service(&service.id).await {
                Ok(true) => {
                    info!(service_id = %service.id, name = %service.name, "stale service removed");
                    report.removed.push(service.id);
                }
                Ok(false) => debug!(service_id = %service.id, "stale service already gone"),
                Err(RegistryError::Bus(err)) => {
                    warn!(service_id = %service.id, error = %err, "stale service removed but unregistration event failed");
                    report.failed += 1;
                    report.removed.push(service.id);
                }
                Err(err) => {
                    error!(service_id = %service.id, error = %err, "failed to remove stale service");
                    report.failed += 1;
                }
            }
        }

        let removed = report.removed.len() as u64;
        {
            let mut counters = self.counters();
            counters.sweeps += 1;
            counters.last_sweep = Some(self.registry.clock().now());
            counters.removed_total += removed;
        }
        metrics::counter!("quark_stale_removals_total").increment(removed);
        if removed > 0 {
            info!(removed, "stale sweep complete");
        }
        Ok(report)
    }
}

fn fallback(service: &ServiceRecord, now: DateTime<Utc>, fresh: bool, reason: String) -> HealthCheckResult {
    warn!(service_id = %service.id, reason = %reason, fresh, "probe failed, falling back to heartbeat");
    if fresh {
        HealthCheckResult::new(&service.id, HealthStatus::Healthy, now).with_warning(format!("probe failed: {reason}"))
    } else {
        HealthCheckResult::new(&service.id, HealthStatus::Unhealthy, now).with_error(format!("probe failed: {reason}"))
    }
}
