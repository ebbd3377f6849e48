use std::time::Duration;

use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Error)]
enum AgentError {
    #[error("{key} is required")]
    Missing { key: &'static str },
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
    #[error("hub unreachable: {0}")]
    Http(#[from] reqwest::Error),
    #[error("hub answered {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone)]
struct AgentConfig {
    hub_url: String,
    service_id: String,
    service_name: String,
    service_type: String,
    service_version: String,
    service_endpoint: Option<String>,
    heartbeat_interval: Duration,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl AgentConfig {
    fn from_lookup<F>(lookup: F) -> Result<Self, AgentError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secs = |key: &'static str, default: u64| -> Result<Duration, AgentError> {
            match get(key) {
                None => Ok(Duration::from_secs(default)),
                Some(value) => match value.trim().parse::<u64>() {
                    Ok(n) if n > 0 => Ok(Duration::from_secs(n)),
                    _ => Err(AgentError::Invalid { key, value }),
                },
            }
        };

        let service_name = get("SERVICE_NAME").ok_or(AgentError::Missing { key: "SERVICE_NAME" })?;
        let service_id = get("SERVICE_ID").unwrap_or_else(|| format!("{}-{}", service_name, uuid::Uuid::new_v4()));
        let retry_attempts = match get("REGISTER_RETRY_ATTEMPTS") {
            None => 3,
            Some(value) => match value.trim().parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => return Err(AgentError::Invalid { key: "REGISTER_RETRY_ATTEMPTS", value }),
            },
        };

        Ok(Self {
            hub_url: get("QUARK_HUB_URL")
                .unwrap_or_else(|| "http://localhost:3000".to_string())
                .trim_end_matches('/')
                .to_string(),
            service_id,
            service_name,
            service_type: get("SERVICE_TYPE").unwrap_or_else(|| "api".to_string()),
            service_version: get("SERVICE_VERSION").unwrap_or_else(|| "1.0.0".to_string()),
            service_endpoint: get("SERVICE_ENDPOINT"),
            heartbeat_interval: secs("HEARTBEAT_INTERVAL_SECS", 30)?,
            retry_attempts,
            retry_delay: secs("REGISTER_RETRY_DELAY_SECS", 5)?,
        })
    }
}

struct HubClient {
    client: Client,
    base: String,
}

impl HubClient {
    fn new(base: impl Into<String>) -> Result<Self, AgentError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, base: base.into() })
    }

    async fn register(&self, config: &AgentConfig) -> Result<(), AgentError> {
        let body = json!({
            "id": config.service_id,
            "name": config.service_name,
            "type": config.service_type,
            "version": config.service_version,
            "endpoint": config.service_endpoint,
        });
        let res = self
            .client
            .post(format!("{}/api/services/register", self.base))
            .json(&body)
            .send()
            .await?;
        check(res).await
    }

    async fn heartbeat(&self, id: &str) -> Result<(), AgentError> {
        let res = self
            .client
            .post(format!("{}/api/services/{}/heartbeat", self.base, id))
            .send()
            .await?;
        check(res).await
    }

    async fn unregister(&self, id: &str) -> Result<(), AgentError> {
        let res = self.client.delete(format!("{}/api/services/{}", self.base, id)).send().await?;
        check(res).await
    }
}

async fn check(res: reqwest::Response) -> Result<(), AgentError> {
    let status = res.status();
    if status.is_success() {
        return Ok(());
    }
    let body = res.text().await.unwrap_or_default();
    Err(AgentError::Rejected { status: status.as_u16(), body })
}

/// Fixed-delay retry; the last error is returned once attempts run out.
async fn register_with_retry(hub: &HubClient, config: &AgentConfig) -> Result<(), AgentError> {
    let mut attempt = 1;
    loop {
        match hub.register(config).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < config.retry_attempts => {
                warn!(attempt, error = %e, "registration failed, retrying");
                tokio::time::sleep(config.retry_delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AgentConfig::from_lookup(|key| std::env::var(key).ok())?;
    let hub = HubClient::new(config.hub_url.clone())?;

    register_with_retry(&hub, &config).await?;
    info!(service_id = %config.service_id, hub = %config.hub_url, "registered with hub");

    let mut ticker = tokio::time::interval_at(Instant::now() + config.heartbeat_interval, config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = hub.heartbeat(&config.service_id).await {
                    warn!(service_id = %config.service_id, error = %e, "heartbeat failed");
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("failed to listen for Ctrl+C: {}", e);
                }
                break;
            }
        }
    }

    match hub.unregister(&config.service_id).await {
        Ok(()) => info!(service_id = %config.service_id, "unregistered from hub"),
        Err(e) => warn!(service_id = %config.service_id, error = %e, "unregister failed"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    /// Answers the n-th connection with `responses[n]`, repeating the last one.
    async fn serve(responses: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let response = responses[n.min(responses.len() - 1)];
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}"), hits)
    }

    const UNAVAILABLE: &str = "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 4\r\nconnection: close\r\n\r\nbusy";
    const CREATED: &str = "HTTP/1.1 201 Created\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}";

    fn config(hub_url: String, attempts: u32) -> AgentConfig {
        AgentConfig {
            hub_url,
            service_id: "svc-1".to_string(),
            service_name: "auth".to_string(),
            service_type: "api".to_string(),
            service_version: "1.0.0".to_string(),
            service_endpoint: None,
            heartbeat_interval: Duration::from_secs(30),
            retry_attempts: attempts,
            retry_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn defaults_and_generated_id() {
        let cfg = AgentConfig::from_lookup(lookup(&[("SERVICE_NAME", "auth")])).unwrap();
        assert_eq!(cfg.hub_url, "http://localhost:3000");
        assert!(cfg.service_id.starts_with("auth-"));
        assert_eq!(cfg.service_type, "api");
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.retry_attempts, 3);
        assert_eq!(cfg.retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn explicit_values_win() {
        let cfg = AgentConfig::from_lookup(lookup(&[
            ("SERVICE_NAME", "auth"),
            ("SERVICE_ID", "auth-1"),
            ("QUARK_HUB_URL", "http://hub:3000/"),
            ("HEARTBEAT_INTERVAL_SECS", "10"),
            ("SERVICE_ENDPOINT", "http://auth:4000"),
        ]))
        .unwrap();
        assert_eq!(cfg.service_id, "auth-1");
        assert_eq!(cfg.hub_url, "http://hub:3000");
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(cfg.service_endpoint.as_deref(), Some("http://auth:4000"));
    }

    #[test]
    fn missing_name_and_bad_numbers_fail() {
        assert!(matches!(
            AgentConfig::from_lookup(lookup(&[])),
            Err(AgentError::Missing { key: "SERVICE_NAME" })
        ));
        assert!(matches!(
            AgentConfig::from_lookup(lookup(&[("SERVICE_NAME", "a"), ("HEARTBEAT_INTERVAL_SECS", "0")])),
            Err(AgentError::Invalid { key: "HEARTBEAT_INTERVAL_SECS", .. })
        ));
        assert!(matches!(
            AgentConfig::from_lookup(lookup(&[("SERVICE_NAME", "a"), ("REGISTER_RETRY_ATTEMPTS", "x")])),
            Err(AgentError::Invalid { key: "REGISTER_RETRY_ATTEMPTS", .. })
        ));
    }

    #[tokio::test]
    async fn registration_retries_until_accepted() {
        let (url, hits) = serve(vec![UNAVAILABLE, UNAVAILABLE, CREATED]).await;
        let hub = HubClient::new(url.clone()).unwrap();

        register_with_retry(&hub, &config(url, 3)).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn registration_gives_up_after_last_attempt() {
        let (url, hits) = serve(vec![UNAVAILABLE]).await;
        let hub = HubClient::new(url.clone()).unwrap();

        let err = register_with_retry(&hub, &config(url, 2)).await.unwrap_err();
        assert!(matches!(err, AgentError::Rejected { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
