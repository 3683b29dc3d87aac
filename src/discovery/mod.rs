use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::DiscoveryConfig;
use crate::relay::RelayAddress;

/// Raised only when the directory is down and nothing was ever cached.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("relay directory unavailable: {0}")]
    Unavailable(String),
}

/// Source of the relay list.
pub trait DirectoryClient: Send + Sync {
    /// Fetch the current relay list.
    fn fetch_relays(&self) -> impl Future<Output = Result<Vec<RelayAddress>>> + Send;
}

/// HTTP directory client for `{"relays": [{"url": "relay://..."}]}` documents.
pub struct HttpDirectoryClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpDirectoryClient {
    /// Create a new directory client.
    pub fn new(cfg: &DiscoveryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.clone(),
        })
    }
}

#[derive(Deserialize)]
struct DirectoryResponse {
    #[serde(default)]
    relays: Vec<RelayDescriptor>,
}

#[derive(Deserialize)]
struct RelayDescriptor {
    url: String,
}

impl DirectoryClient for HttpDirectoryClient {
    async fn fetch_relays(&self) -> Result<Vec<RelayAddress>> {
        debug!(endpoint = %self.endpoint, "fetching relay directory");

        let response = self
            .http
            .get(&self.endpoint)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("requesting {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            bail!("unexpected status {} from {}", status, self.endpoint);
        }

        let body = response
            .bytes()
            .await
            .with_context(|| format!("reading response from {}", self.endpoint))?;

        parse_directory(&body)
    }
}

/// Decode a directory document, skipping descriptors whose URL does not parse.
pub fn parse_directory(body: &[u8]) -> Result<Vec<RelayAddress>> {
    let doc: DirectoryResponse =
        serde_json::from_slice(body).context("decoding relay directory")?;

    let mut relays = Vec::with_capacity(doc.relays.len());
    for descriptor in doc.relays {
        match RelayAddress::parse(&descriptor.url) {
            Ok(addr) => relays.push(addr),
            Err(e) => debug!(url = %descriptor.url, error = %e, "skipping relay descriptor"),
        }
    }

    Ok(relays)
}

struct CachedList {
    fetched_at: Instant,
    relays: Vec<RelayAddress>,
}

/// Time-cached relay list.
///
/// Refreshes lazily on the first request after the freshness window expires.
/// A failed refresh serves the stale list and waits a full window before the
/// next attempt.
pub struct DiscoveryCache<D> {
    source: D,
    ttl: Duration,
    cached: Mutex<Option<CachedList>>,
}

impl<D: DirectoryClient> DiscoveryCache<D> {
    /// Wrap a directory client with a freshness window.
    pub fn new(source: D, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Return the relay list, refreshing it first if the cached copy is stale.
    pub async fn list_relays(&self) -> Result<Vec<RelayAddress>, DiscoveryError> {
        let mut cached = self.cached.lock().await;

        if let Some(entry) = cached.as_ref() {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.relays.clone());
            }
        }

        match self.source.fetch_relays().await {
            Ok(relays) => {
                debug!(count = relays.len(), "relay directory refreshed");
                let list = relays.clone();
                *cached = Some(CachedList {
                    fetched_at: Instant::now(),
                    relays,
                });
                Ok(list)
            }
            Err(e) => match cached.as_mut() {
                Some(entry) => {
                    warn!(
                        error = %e,
                        count = entry.relays.len(),
                        retry_in = ?self.ttl,
                        "relay directory refresh failed, serving stale list",
                    );
                    entry.fetched_at = Instant::now();
                    Ok(entry.relays.clone())
                }
                None => Err(DiscoveryError::Unavailable(format!("{e:#}"))),
            },
        }
    }
}
