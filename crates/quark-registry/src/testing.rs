use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use quark_bus::{BusConfig, EventBus, MemoryBroker, StreamConfig};
use quark_core::{Collection, KeyValueStore, ManualClock, ServiceRecord, ServiceRegistration, ServiceType, StoreError};
use quark_db::MemoryStore;

use crate::error::ProbeError;
use crate::probe::Prober;
use crate::registry::{Registry, RegistryConfig};

pub(crate) struct Harness {
    pub registry: Arc<Registry>,
    pub bus: Arc<EventBus>,
    pub clock: Arc<ManualClock>,
    pub start: DateTime<Utc>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self::build(Arc::new(MemoryStore::new()), config)
    }

    pub fn with_store(store: Arc<dyn KeyValueStore>) -> Self {
        Self::build(store, RegistryConfig::default())
    }

    fn build(store: Arc<dyn KeyValueStore>, config: RegistryConfig) -> Self {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let broker = Arc::new(MemoryBroker::connected(StreamConfig::default()));
        let bus = Arc::new(EventBus::new(broker, BusConfig::default()));
        let registry = Arc::new(Registry::new(store, bus.clone(), clock.clone(), config));

        Self {
            registry,
            bus,
            clock,
            start,
        }
    }

    /// Registers an `api` service without an endpoint.
    pub async fn register(&self, id: &str, name: &str) -> ServiceRecord {
        self.registry
            .register_service(ServiceRegistration::new(id, name, ServiceType::Api))
            .await
            .unwrap()
    }
}

/// Store where, once armed, every service read or in-place update races a
/// concurrent unregister that deletes the record first.
pub(crate) struct VanishingStore {
    inner: MemoryStore,
    armed: AtomicBool,
}

impl VanishingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            armed: AtomicBool::new(false),
        })
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    fn racing(&self, collection: Collection) -> bool {
        collection == Collection::Services && self.armed.load(Ordering::SeqCst)
    }
}

impl KeyValueStore for VanishingStore {
    fn put(&self, collection: Collection, id: &str, document: &str) -> Result<(), StoreError> {
        self.inner.put(collection, id, document)
    }

    fn get(&self, collection: Collection, id: &str) -> Result<Option<String>, StoreError> {
        let document = self.inner.get(collection, id)?;
        if self.racing(collection) {
            self.inner.delete(collection, id)?;
        }
        Ok(document)
    }

    fn delete(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        self.inner.delete(collection, id)
    }

    fn all(&self, collection: Collection) -> Result<Vec<(String, String)>, StoreError> {
        self.inner.all(collection)
    }

    fn update(
        &self,
        collection: Collection,
        id: &str,
        apply: &mut dyn FnMut(&str) -> Result<Option<String>, StoreError>,
    ) -> Result<bool, StoreError> {
        if self.racing(collection) {
            self.inner.delete(collection, id)?;
        }
        self.inner.update(collection, id, apply)
    }
}

enum Script {
    Healthy,
    Failing,
    Hanging,
}

pub(crate) struct ScriptedProber {
    script: Script,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProber {
    fn build(script: Script, delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            script,
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn healthy() -> Arc<Self> {
        Self::build(Script::Healthy, None)
    }

    pub fn delayed(delay: Duration) -> Arc<Self> {
        Self::build(Script::Healthy, Some(delay))
    }

    pub fn failing() -> Arc<Self> {
        Self::build(Script::Failing, None)
    }

    pub fn hanging() -> Arc<Self> {
        Self::build(Script::Hanging, None)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, _endpoint: &str) -> Result<Duration, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = match self.script {
            Script::Healthy => Ok(Duration::from_millis(12)),
            Script::Failing => Err(ProbeError::Transport("connection refused".into())),
            Script::Hanging => std::future::pending().await,
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
