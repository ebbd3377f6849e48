use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use quark_bus::BusConfig;
use quark_registry::{MonitorConfig, RegistryConfig, UnknownHeartbeatPolicy};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub host: IpAddr,
    pub port: u16,
    /// SQLite path. The in-memory store is used when unset.
    pub database_url: Option<String>,
    pub monitoring_enabled: bool,
    pub monitor: MonitorConfig,
    pub registry: RegistryConfig,
    pub bus: BusConfig,
}

impl HubConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = MonitorConfig::default();

        let monitor = MonitorConfig {
            check_interval: env.secs("HEALTH_CHECK_INTERVAL_SECS", defaults.check_interval)?,
            sweep_interval: env.secs("STALE_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            heartbeat_timeout: env.secs("HEARTBEAT_TIMEOUT_SECS", defaults.heartbeat_timeout)?,
            heartbeat_freshness: env.secs("HEARTBEAT_FRESHNESS_SECS", defaults.heartbeat_freshness)?,
            stale_timeout: env.secs("STALE_TIMEOUT_SECS", defaults.stale_timeout)?,
            probe_timeout: env.secs("PROBE_TIMEOUT_SECS", defaults.probe_timeout)?,
            max_concurrent_probes: env.parse("MAX_CONCURRENT_PROBES", defaults.max_concurrent_probes)?,
            probe_path: defaults.probe_path,
        };

        let registry = RegistryConfig {
            unknown_heartbeat: env.parse("UNKNOWN_HEARTBEAT_POLICY", UnknownHeartbeatPolicy::default())?,
        };

        let bus = BusConfig {
            subject_prefix: env.get("EVENT_SUBJECT_PREFIX").unwrap_or_else(|| "quark".to_string()),
            ..BusConfig::default()
        };

        Ok(Self {
            host: env.parse("HOST", IpAddr::from([0, 0, 0, 0]))?,
            port: env.parse("PORT", 3000)?,
            database_url: env.get("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            monitoring_enabled: env.parse("MONITORING_ENABLED", true)?,
            monitor,
            registry,
            bus,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: ToString,
    {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: value.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn secs(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let secs = self.parse(key, default.as_secs())?;
        if secs == 0 {
            return Err(ConfigError::Invalid {
                key,
                value: "0".to_string(),
                reason: "must be at least 1 second".to_string(),
            });
        }
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<HubConfig, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        HubConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[]).unwrap();
        assert_eq!(config.addr().to_string(), "0.0.0.0:3000");
        assert!(config.database_url.is_none());
        assert!(config.monitoring_enabled);
        assert_eq!(config.monitor.check_interval, Duration::from_secs(30));
        assert_eq!(config.monitor.stale_timeout, Duration::from_secs(300));
        assert_eq!(config.registry.unknown_heartbeat, UnknownHeartbeatPolicy::Ignore);
        assert_eq!(config.bus.subject_prefix, "quark");
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("PORT", "8080"),
            ("HOST", "127.0.0.1"),
            ("DATABASE_URL", "hub.db"),
            ("HEARTBEAT_TIMEOUT_SECS", "90"),
            ("MAX_CONCURRENT_PROBES", "4"),
            ("UNKNOWN_HEARTBEAT_POLICY", "reject"),
            ("MONITORING_ENABLED", "false"),
        ])
        .unwrap();

        assert_eq!(config.addr().to_string(), "127.0.0.1:8080");
        assert_eq!(config.database_url.as_deref(), Some("hub.db"));
        assert_eq!(config.monitor.heartbeat_timeout, Duration::from_secs(90));
        assert_eq!(config.monitor.max_concurrent_probes, 4);
        assert_eq!(config.registry.unknown_heartbeat, UnknownHeartbeatPolicy::Reject);
        assert!(!config.monitoring_enabled);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = config(&[("PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PORT", .. }));

        let err = config(&[("STALE_TIMEOUT_SECS", "0")]).unwrap_err();
        assert!(err.to_string().contains("STALE_TIMEOUT_SECS"));
    }
}
