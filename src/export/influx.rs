use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Url;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::health::HealthMetrics;
use crate::config::InfluxConfig;
use crate::relay::{RelayStatus, RATE_LABELS};

/// One cycle rendered as line protocol, ready to POST.
#[derive(Debug)]
struct CycleBody {
    points: usize,
    lines: String,
}

/// InfluxDB line-protocol exporter.
///
/// Each cycle becomes six measurements (`bandwidth-10s` .. `bandwidth-60m`),
/// one point per relay tagged with the relay id. Cycles pass through a
/// bounded queue to a single background writer; a full queue drops the cycle.
pub struct InfluxExporter {
    cfg: InfluxConfig,
    health: Option<Arc<HealthMetrics>>,
    tx: Option<mpsc::Sender<CycleBody>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InfluxExporter {
    /// Creates a new exporter with the given configuration.
    pub fn new(cfg: InfluxConfig, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            cfg,
            health,
            tx: None,
            worker: Mutex::new(None),
        }
    }

    /// Spawn the background writer. Stops and drains when `ctx` is cancelled.
    pub fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let url = write_url(&self.cfg)?;

        let client = reqwest::Client::builder()
            .timeout(self.cfg.timeout)
            .build()
            .context("building HTTP client")?;

        let (tx, mut rx) = mpsc::channel::<CycleBody>(self.cfg.max_queue_size);
        self.tx = Some(tx);

        let cfg = Arc::new(self.cfg.clone());
        let health = self.health.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        while let Ok(body) = rx.try_recv() {
                            send_logged(&client, &url, &cfg, health.as_deref(), body).await;
                        }
                        return;
                    }

                    body = rx.recv() => {
                        match body {
                            Some(body) => {
                                send_logged(&client, &url, &cfg, health.as_deref(), body).await;
                            }
                            None => return,
                        }
                    }
                }
            }
        });

        *self.worker.lock() = Some(handle);

        tracing::info!(
            address = %self.cfg.address,
            database = %self.cfg.database,
            compression = %self.cfg.compression,
            "InfluxDB exporter started",
        );

        Ok(())
    }

    /// Queue one cycle's rates for export. Never blocks.
    pub fn export(&self, taken_at: DateTime<Utc>, statuses: &BTreeMap<String, RelayStatus>) {
        let Some(tx) = &self.tx else {
            return;
        };

        if statuses.is_empty() {
            return;
        }

        let body = CycleBody {
            points: statuses.len() * RATE_LABELS.len(),
            lines: encode_lines(taken_at, statuses),
        };

        if tx.try_send(body).is_err() {
            tracing::warn!(
                relays = statuses.len(),
                "InfluxDB export queue full, dropping cycle",
            );
            if let Some(health) = &self.health {
                health.export_dropped.inc();
            }
        }
    }

    /// Wait for the background writer to finish draining after cancellation.
    pub async fn wait_for_shutdown(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::debug!(error = %e, "InfluxDB export worker join failed");
            }
        }
    }
}

async fn send_logged(
    client: &reqwest::Client,
    url: &Url,
    cfg: &InfluxConfig,
    health: Option<&HealthMetrics>,
    body: CycleBody,
) {
    if let Err(e) = send_batch(client, url, cfg, body).await {
        tracing::warn!(error = %e, "InfluxDB export request failed");
        if let Some(health) = health {
            health.export_errors.inc();
        }
    }
}

/// POST one cycle of line protocol.
async fn send_batch(
    client: &reqwest::Client,
    url: &Url,
    cfg: &InfluxConfig,
    body: CycleBody,
) -> Result<()> {
    let raw_len = body.lines.len();
    let payload = compress(body.lines.as_bytes(), &cfg.compression)
        .context("compressing line protocol")?;

    let mut request = client
        .post(url.clone())
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(payload);

    if let Some(encoding) = content_encoding(&cfg.compression) {
        request = request.header("Content-Encoding", encoding);
    }

    if !cfg.username.is_empty() {
        request = request.basic_auth(&cfg.username, Some(&cfg.password));
    }

    let resp = request
        .send()
        .await
        .context("sending InfluxDB write request")?;

    let status = resp.status();
    // Drain body for connection reuse.
    let _ = resp.bytes().await;

    if !status.is_success() {
        bail!("InfluxDB write unexpected status: {status}");
    }

    tracing::debug!(points = body.points, bytes = raw_len, "exported cycle to InfluxDB");

    Ok(())
}

/// `<address>/write?db=<database>&precision=s`
fn write_url(cfg: &InfluxConfig) -> Result<Url> {
    let base = format!("{}/write", cfg.address.trim_end_matches('/'));
    Url::parse_with_params(&base, &[("db", cfg.database.as_str()), ("precision", "s")])
        .with_context(|| format!("invalid influx address {:?}", cfg.address))
}

/// Render a cycle as line protocol, one line per (window, relay).
pub fn encode_lines(taken_at: DateTime<Utc>, statuses: &BTreeMap<String, RelayStatus>) -> String {
    let ts = taken_at.timestamp();
    let mut out = String::with_capacity(statuses.len() * RATE_LABELS.len() * 64);

    for (window, label) in RATE_LABELS.iter().enumerate() {
        for (relay, status) in statuses {
            let rate = status.rates[window];
            let _ = writeln!(
                out,
                "bandwidth-{label},relay={} value={rate}i {ts}",
                escape_tag(relay)
            );
        }
    }

    out
}

/// Escape a tag value (commas, equals signs, spaces).
fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '=' | ' ') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// --- Compression ---

/// Compresses data using the specified algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::time::Duration;

    use axum::body::Bytes;
    use axum::extract::{RawQuery, State};
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::Router;
    use chrono::TimeZone;

    use super::*;

    fn at() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0)
            .single()
            .expect("valid timestamp")
    }

    fn cycle() -> BTreeMap<String, RelayStatus> {
        let mut statuses = BTreeMap::new();
        statuses.insert(
            "1.2.3.4:22067".to_string(),
            RelayStatus {
                rates: [1, 2, 3, 4, 5, 6],
                ..Default::default()
            },
        );
        statuses.insert(
            "5.6.7.8:443".to_string(),
            RelayStatus {
                rates: [10, 20, 30, 40, 50, 60],
                ..Default::default()
            },
        );
        statuses
    }

    #[test]
    fn test_encode_lines_one_measurement_per_window() {
        let lines = encode_lines(at(), &cycle());
        let lines: Vec<&str> = lines.lines().collect();

        assert_eq!(lines.len(), 12);
        assert_eq!(lines[0], "bandwidth-10s,relay=1.2.3.4:22067 value=1i 1700000000");
        assert_eq!(lines[1], "bandwidth-10s,relay=5.6.7.8:443 value=10i 1700000000");
        assert_eq!(lines[2], "bandwidth-1m,relay=1.2.3.4:22067 value=2i 1700000000");
        assert_eq!(lines[11], "bandwidth-60m,relay=5.6.7.8:443 value=60i 1700000000");
    }

    #[test]
    fn test_escape_tag() {
        assert_eq!(escape_tag("a b,c=d"), r"a\ b\,c\=d");
        assert_eq!(escape_tag("1.2.3.4:22067"), "1.2.3.4:22067");
    }

    #[test]
    fn test_write_url() {
        let cfg = InfluxConfig {
            address: "http://influx:8086/".to_string(),
            database: "relay stats".to_string(),
            ..Default::default()
        };
        let url = write_url(&cfg).expect("valid url");
        assert_eq!(
            url.as_str(),
            "http://influx:8086/write?db=relay+stats&precision=s"
        );
    }

    #[test]
    fn test_compress_none() {
        let data = b"bandwidth-10s value=1i";
        let result = compress(data, "none").expect("compress none");
        assert_eq!(result, data);
    }

    #[test]
    fn test_compress_gzip_roundtrip() {
        let data = b"bandwidth-10s,relay=a value=1i 1700000000\n";
        let compressed = compress(data, "gzip").expect("gzip compress");
        assert_ne!(compressed, data.as_slice());

        use flate2::read::GzDecoder;
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .expect("gzip decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_content_encoding() {
        assert_eq!(content_encoding("gzip"), Some("gzip"));
        assert_eq!(content_encoding("none"), None);
        assert!(compress(b"x", "zstd").is_err());
    }

    #[test]
    fn test_full_queue_drops_cycle() {
        let health = Arc::new(HealthMetrics::new().expect("metrics"));
        let (tx, _rx) = mpsc::channel(1);
        let exporter = InfluxExporter {
            cfg: InfluxConfig::default(),
            health: Some(Arc::clone(&health)),
            tx: Some(tx),
            worker: Mutex::new(None),
        };

        exporter.export(at(), &cycle());
        exporter.export(at(), &cycle());
        exporter.export(at(), &BTreeMap::new());

        assert_eq!(health.export_dropped.get(), 1.0);
    }

    #[test]
    fn test_export_before_start_is_noop() {
        let exporter = InfluxExporter::new(InfluxConfig::default(), None);
        exporter.export(at(), &cycle());
    }

    #[derive(Debug)]
    struct Captured {
        query: Option<String>,
        headers: HeaderMap,
        body: Bytes,
    }

    #[tokio::test]
    async fn test_posts_gzipped_line_protocol_with_auth() {
        let (seen_tx, mut seen_rx) = mpsc::channel::<Captured>(4);

        let app = Router::new()
            .route(
                "/write",
                post(
                    |State(seen): State<mpsc::Sender<Captured>>,
                     RawQuery(query): RawQuery,
                     headers: HeaderMap,
                     body: Bytes| async move {
                        let _ = seen.send(Captured { query, headers, body }).await;
                        axum::http::StatusCode::NO_CONTENT
                    },
                ),
            )
            .with_state(seen_tx);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let cfg = InfluxConfig {
            enabled: true,
            address: format!("http://{addr}"),
            database: "syncthingrelay".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            compression: "gzip".to_string(),
            ..Default::default()
        };

        let cancel = CancellationToken::new();
        let mut exporter = InfluxExporter::new(cfg, None);
        exporter.start(cancel.clone()).expect("start");
        exporter.export(at(), &cycle());

        let captured = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .expect("request within timeout")
            .expect("request captured");

        assert_eq!(
            captured.query.as_deref(),
            Some("db=syncthingrelay&precision=s")
        );
        assert_eq!(
            captured
                .headers
                .get("content-encoding")
                .and_then(|v| v.to_str().ok()),
            Some("gzip")
        );
        // base64("admin:secret")
        assert_eq!(
            captured
                .headers
                .get("authorization")
                .and_then(|v| v.to_str().ok()),
            Some("Basic YWRtaW46c2VjcmV0")
        );

        let mut decoder = flate2::read::GzDecoder::new(captured.body.as_ref());
        let mut lines = String::new();
        decoder.read_to_string(&mut lines).expect("gzip body");
        assert_eq!(lines, encode_lines(at(), &cycle()));

        cancel.cancel();
        exporter.wait_for_shutdown().await;
    }
}
