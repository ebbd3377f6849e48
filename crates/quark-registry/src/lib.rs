pub mod error;
pub mod monitor;
pub mod probe;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ProbeError, RegistryError, RegistryResult};
pub use monitor::{HealthMonitor, HealthSummary, MonitorConfig, MonitoringStats, SweepReport, TickReport};
pub use probe::{HttpProber, Prober};
pub use registry::{Registry, RegistryConfig, ServiceStats, UnknownHeartbeatPolicy};
