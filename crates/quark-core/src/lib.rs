pub mod service;
pub mod module;
pub mod health;
pub mod event;
pub mod subject;
pub mod store;
pub mod errors;
pub mod time;

pub use service::{Resources, ServiceHealth, ServiceRecord, ServiceRegistration, ServiceStatus, ServiceType};
pub use module::{
    ApiEndpoint, DependencyKind, EventDefinition, EventDirection, ModuleApi, ModuleDependency, ModuleManifest,
    ModuleRecord, ModuleRuntime, ModuleType, ResourceLimits, RuntimeEngine,
};
pub use health::{HealthCheckResult, HealthStatus};
pub use event::{Event, HUB_SOURCE};
pub use subject::{Subject, SubjectPattern, validate_token};
pub use store::{Collection, DocumentStore, KeyValueStore};
pub use errors::{StoreError, SubjectError};
pub use time::{Clock, ManualClock, SystemClock};
