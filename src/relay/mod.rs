use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::RelayConfig;

/// Number of throughput windows reported by a relay (10s, 1m, 5m, 15m, 30m, 60m).
pub const RATE_WINDOWS: usize = 6;

/// Human-readable labels for the rate windows, in wire order.
pub const RATE_LABELS: [&str; RATE_WINDOWS] = ["10s", "1m", "5m", "15m", "30m", "60m"];

/// A relay as advertised by the discovery directory.
///
/// Wraps the raw descriptor URL (e.g. `relay://1.2.3.4:22067/?statusAddr=:22070`)
/// and the derived relay id and status endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAddress {
    raw: String,
    id: String,
    status_url: String,
}

impl RelayAddress {
    /// Parse a descriptor URL.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("parsing relay url {raw:?}"))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .with_context(|| format!("relay url {raw:?} has no host"))?;

        let id = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let status_addr = url
            .query_pairs()
            .find(|(k, _)| k == "statusAddr")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default();

        // statusAddr is ":port" (or empty); the relay host is reused.
        let status_url = format!("http://{host}{status_addr}/status");

        Ok(Self {
            raw: raw.to_string(),
            id,
            status_url,
        })
    }

    /// Relay identifier used as row label and storage key (`host[:port]`).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The status endpoint queried each cycle.
    pub fn status_url(&self) -> &str {
        &self.status_url
    }

    /// The descriptor URL as received from discovery.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for RelayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Self-reported relay metrics at fetch time.
///
/// Field names follow the relay's `/status` JSON so a stored record is the
/// same document the relay served.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatus {
    #[serde(rename = "bytesProxied")]
    pub bytes_proxied: u64,
    #[serde(rename = "numActiveSessions", default)]
    pub num_active_sessions: u64,
    #[serde(rename = "numConnections", default)]
    pub num_connections: u64,
    /// Throughput per window, bytes/sec.
    #[serde(rename = "kbps10s1m5m15m30m60m")]
    pub rates: [u64; RATE_WINDOWS],
    #[serde(default)]
    pub options: RelayOptions,
}

/// Free-form relay options. Only the operator label is retained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayOptions {
    #[serde(rename = "provided-by", default)]
    pub provided_by: String,
}

/// Per-relay fetch failure. The relay is dropped from the current cycle.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("relay unreachable: {0}")]
    Unreachable(String),
    #[error("relay timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed status response: {0}")]
    MalformedResponse(String),
}

impl FetchError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "unreachable",
            Self::Timeout(_) => "timeout",
            Self::MalformedResponse(_) => "malformed",
        }
    }
}

/// Callback type for recording relay request metrics.
/// Receives (outcome, duration) where outcome is "success" or an error kind.
pub type MetricsCallback = Box<dyn Fn(&str, Duration) + Send + Sync>;

/// Relay status client.
pub trait RelayClient: Send + Sync + 'static {
    /// Fetch and parse one relay's current status.
    fn fetch_status(
        &self,
        relay: &RelayAddress,
    ) -> impl Future<Output = Result<RelayStatus, FetchError>> + Send;
}

/// HTTP-based relay status client.
pub struct HttpRelayClient {
    http: reqwest::Client,
    timeout: Duration,
    metrics: Option<MetricsCallback>,
}

impl HttpRelayClient {
    /// Create a new relay client with the configured request timeout.
    pub fn new(cfg: &RelayConfig) -> Result<Self> {
        let timeout = cfg.timeout;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            timeout,
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, outcome: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(outcome, duration);
        }
    }

    async fn get_status(&self, url: &str) -> Result<RelayStatus, FetchError> {
        let response = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status_code = response.status();
        if !status_code.is_success() {
            return Err(FetchError::Unreachable(format!(
                "unexpected status {status_code}"
            )));
        }

        let body = response.bytes().await.map_err(|e| self.classify(e))?;

        parse_status(&body)
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Unreachable(err.to_string())
        }
    }
}

impl RelayClient for HttpRelayClient {
    async fn fetch_status(&self, relay: &RelayAddress) -> Result<RelayStatus, FetchError> {
        debug!(relay = %relay, url = relay.status_url(), "fetching relay status");

        let start = Instant::now();
        let result = self.get_status(relay.status_url()).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        self.record_request(outcome, start.elapsed());

        result
    }
}

/// Decode a `/status` document.
pub fn parse_status(body: &[u8]) -> Result<RelayStatus, FetchError> {
    serde_json::from_slice(body).map_err(|e| FetchError::MalformedResponse(e.to_string()))
}
