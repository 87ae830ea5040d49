use crate::config::BackendConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;

pub const HEALTH_CHECK_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Last observed health per backend. Writes are last-writer-wins.
#[derive(Debug, Default)]
pub struct HealthCache {
    entries: Mutex<HashMap<String, Health>>,
}

impl HealthCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Health {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    pub fn set(&self, name: &str, health: Health) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), health);
    }

    pub fn mark_healthy(&self, name: &str) {
        self.set(name, Health::Healthy);
    }

    pub fn mark_unhealthy(&self, name: &str) {
        self.set(name, Health::Unhealthy);
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        self.get(name) == Health::Healthy
    }

    pub fn forget(&self, name: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid health check target: {0}")]
    InvalidTarget(String),
    #[error("connection failed: {0}")]
    Unreachable(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
}

/// Decides whether a backend is accepting connections.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, name: &str, config: &BackendConfig) -> Result<(), ProbeError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum HealthCheckTarget {
    Http(String),
    Tcp(String, u16),
}

pub fn parse_health_check(url: &str) -> Result<HealthCheckTarget, ProbeError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(HealthCheckTarget::Http(url.to_string()))
    } else if let Some(rest) = url.strip_prefix("tcp://") {
        parse_host_port(rest)
    } else {
        Err(ProbeError::InvalidTarget(format!(
            "unsupported health check scheme: {url}"
        )))
    }
}

/// `host:port` or `[v6]:port`.
fn parse_host_port(value: &str) -> Result<HealthCheckTarget, ProbeError> {
    let (host, port_str) = if let Some(rest) = value.strip_prefix('[') {
        rest.split_once("]:").ok_or_else(|| {
            ProbeError::InvalidTarget(format!("bad IPv6 address: {value}"))
        })?
    } else {
        value
            .rsplit_once(':')
            .ok_or_else(|| ProbeError::InvalidTarget(format!("missing port: {value}")))?
    };
    let port: u16 = port_str
        .parse()
        .map_err(|_| ProbeError::InvalidTarget(format!("invalid port: {port_str}")))?;
    Ok(HealthCheckTarget::Tcp(host.to_string(), port))
}

/// The target to probe: `health_check` when set, else the backend address.
pub fn probe_target(config: &BackendConfig) -> Result<HealthCheckTarget, ProbeError> {
    match config.health_check {
        Some(ref url) => parse_health_check(url),
        None => parse_host_port(&config.address),
    }
}

/// TCP connect or HTTP GET against the configured target.
pub struct TargetProbe {
    client: reqwest::Client,
}

impl TargetProbe {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(HEALTH_CHECK_ATTEMPT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    async fn check_http(&self, url: &str) -> Result<(), ProbeError> {
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(HEALTH_CHECK_ATTEMPT_TIMEOUT)
            } else {
                ProbeError::Unreachable(e.to_string())
            }
        })?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ProbeError::Status(resp.status().as_u16()))
        }
    }
}

async fn check_tcp(host: &str, port: u16) -> Result<(), ProbeError> {
    let addr = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    match tokio::time::timeout(HEALTH_CHECK_ATTEMPT_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(ProbeError::Unreachable(e.to_string())),
        Err(_) => Err(ProbeError::Timeout(HEALTH_CHECK_ATTEMPT_TIMEOUT)),
    }
}

#[async_trait]
impl HealthProbe for TargetProbe {
    async fn probe(&self, _name: &str, config: &BackendConfig) -> Result<(), ProbeError> {
        match probe_target(config)? {
            HealthCheckTarget::Http(url) => self.check_http(&url).await,
            HealthCheckTarget::Tcp(host, port) => check_tcp(&host, port).await,
        }
    }
}
