use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::redirect::Policy;

use crate::error::ProbeError;

/// Outbound liveness check against a service endpoint.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Returns the round trip on success.
    async fn probe(&self, endpoint: &str) -> Result<Duration, ProbeError>;
}

/// `GET <endpoint><path>` with a hard timeout.
///
/// Redirects are not followed, so a 3xx answer counts as alive just like a
/// 2xx one.
pub struct HttpProber {
    client: reqwest::Client,
    path: String,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(timeout: Duration, path: impl Into<String>) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            path: path.into(),
            timeout,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", endpoint.trim_end_matches('/'), self.path)
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, endpoint: &str) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        let response = self.client.get(self.url(endpoint)).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(self.timeout)
            } else {
                ProbeError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            Ok(started.elapsed())
        } else {
            Err(ProbeError::Status(status.as_u16()))
        }
    }
}
