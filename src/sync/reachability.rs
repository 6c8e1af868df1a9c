//! Lightweight liveness check of the remote endpoint.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{CollectorError, Result};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Reachable when a TCP connection to the endpoint opens in time
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(address: String, timeout: Duration) -> Self {
        Self { address, timeout }
    }

    /// Probe the host and port of an endpoint URL
    ///
    /// # Errors
    ///
    /// Returns `InvalidEndpoint` when the URL does not parse or has no host
    pub fn for_endpoint(endpoint: &str, timeout: Duration) -> Result<Self> {
        let url = reqwest::Url::parse(endpoint)
            .map_err(|e| CollectorError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| CollectorError::InvalidEndpoint(format!("{}: no host", endpoint)))?;
        let port = url.port_or_known_default().unwrap_or(443);
        Ok(Self::new(format!("{}:{}", host, port), timeout))
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn is_reachable(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("{} unreachable: {}", self.address, e);
                false
            }
            Err(_) => {
                debug!("{} did not answer within {:?}", self.address, self.timeout);
                false
            }
        }
    }
}
