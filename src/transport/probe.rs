//! Capability probe run before opening the duplex link.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::ConnectError;

/// Result of a capability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The backend can serve a voice session.
    Available,
    /// The backend is reachable but not configured (e.g. missing API key).
    Unavailable,
}

/// Pre-connect check that the backend can service a session.
#[async_trait]
pub trait CapabilityProbe: Send + Sync + 'static {
    /// Ask the backend whether a session can be started.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Probe`] when the check itself cannot complete.
    async fn probe(&self) -> Result<ProbeOutcome, ConnectError>;
}

/// Probe that always answers the same outcome.
///
/// Used when no probe endpoint is configured, and in tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub ProbeOutcome);

#[async_trait]
impl CapabilityProbe for StaticProbe {
    async fn probe(&self) -> Result<ProbeOutcome, ConnectError> {
        Ok(self.0)
    }
}

#[derive(Debug, Deserialize)]
struct ProbeResponse {
    #[serde(default, alias = "configured")]
    available: bool,
}

/// HTTP probe: `GET <url>` answering `{"available": bool}`.
///
/// 401/403 responses count as unavailable; any other failure is a probe error.
#[derive(Debug, Clone)]
pub struct HttpCapabilityProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpCapabilityProbe {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ConnectError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConnectError::Probe(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CapabilityProbe for HttpCapabilityProbe {
    async fn probe(&self) -> Result<ProbeOutcome, ConnectError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ConnectError::Probe(format!("request: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            tracing::info!(%status, "capability probe rejected credentials");
            return Ok(ProbeOutcome::Unavailable);
        }
        if !status.is_success() {
            return Err(ConnectError::Probe(format!("unexpected status {status}")));
        }

        let body: ProbeResponse = response
            .json()
            .await
            .map_err(|e| ConnectError::Probe(format!("decode: {e}")))?;

        tracing::debug!(available = body.available, "capability probe answered");
        Ok(if body.available {
            ProbeOutcome::Available
        } else {
            ProbeOutcome::Unavailable
        })
    }
}
