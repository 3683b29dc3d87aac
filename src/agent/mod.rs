use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::discovery::{DiscoveryCache, HttpDirectoryClient};
use crate::export::health::HealthMetrics;
use crate::export::influx::InfluxExporter;
use crate::poller::Poller;
use crate::reconcile::CounterReconciler;
use crate::relay::HttpRelayClient;
use crate::server::StatusServer;
use crate::store::SnapshotStore;
use crate::view::AggregationView;

/// Agent owns the store, reconciler, poller, exporter and HTTP server.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    store: Option<Arc<SnapshotStore>>,
    server: Option<StatusServer>,
    exporter: Option<Arc<InfluxExporter>>,
    poller: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health = Arc::new(HealthMetrics::new().context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            store: None,
            server: None,
            exporter: None,
            poller: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Open storage, replay history, start serving and polling.
    ///
    /// Returns the address the status server is bound to.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        // 1. Open the snapshot store.
        let path = self.cfg.database_path.clone();
        let store = tokio::task::spawn_blocking(move || SnapshotStore::open(&path))
            .await
            .context("joining store open task")?
            .with_context(|| {
                format!(
                    "opening snapshot store at {}",
                    self.cfg.database_path.display()
                )
            })?;
        let store = Arc::new(store);
        info!(
            path = %self.cfg.database_path.display(),
            size = store.size_on_disk().unwrap_or(0),
            "snapshot store opened",
        );

        // 2. Rebuild counter history before anything can be served.
        let reconciler = self.create_reconciler();
        let replay_start = Instant::now();
        let replayed = {
            let store = Arc::clone(&store);
            let reconciler = Arc::clone(&reconciler);
            tokio::task::spawn_blocking(move || reconciler.replay(store.all_in_order()))
                .await
                .context("joining replay task")?
                .context("replaying stored snapshots")?
        };
        info!(
            snapshots = replayed,
            elapsed_ms = replay_start.elapsed().as_millis() as u64,
            "counter history restored",
        );

        // 3. Start the HTTP surface.
        let view = AggregationView::new(Arc::clone(&store), Arc::clone(&reconciler));
        let server = StatusServer::new(
            self.cfg.bind_addr(),
            view,
            Arc::clone(&store),
            Arc::clone(&self.health),
        );
        let local_addr = server
            .start()
            .await
            .context("starting status server")?;
        self.server = Some(server);

        // 4. Optional InfluxDB exporter.
        if self.cfg.influx.enabled {
            let mut exporter =
                InfluxExporter::new(self.cfg.influx.clone(), Some(Arc::clone(&self.health)));
            exporter
                .start(self.cancel.child_token())
                .context("starting InfluxDB exporter")?;
            self.exporter = Some(Arc::new(exporter));

            info!(address = %self.cfg.influx.address, "InfluxDB exporter configured");
        }

        // 5. Relay and directory clients.
        let client = self.create_relay_client()?;
        let directory =
            HttpDirectoryClient::new(&self.cfg.discovery).context("creating directory client")?;
        let discovery = Arc::new(DiscoveryCache::new(
            directory,
            self.cfg.discovery.refresh_interval,
        ));

        // 6. Start the polling loop.
        let mut poller = Poller::new(
            Arc::new(client),
            discovery,
            reconciler,
            Arc::clone(&store),
            Arc::clone(&self.health),
        );
        if let Some(exporter) = &self.exporter {
            poller = poller.with_exporter(Arc::clone(exporter));
        }
        let handle = Arc::new(poller).spawn(self.cfg.poll_interval, self.cancel.child_token());
        self.poller = Some(handle);
        self.store = Some(store);

        info!(
            poll_interval = ?self.cfg.poll_interval,
            discovery = %self.cfg.discovery.endpoint,
            "agent fully started",
        );

        Ok(local_addr)
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        // Let an in-flight cycle finish its write.
        if let Some(handle) = self.poller.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "polling loop terminated abnormally");
            }
        }

        if let Some(exporter) = &self.exporter {
            exporter.wait_for_shutdown().await;
        }

        if let Some(server) = &self.server {
            server.stop().await?;
        }

        if let Some(store) = self.store.take() {
            tokio::task::spawn_blocking(move || store.flush())
                .await
                .context("joining store flush task")?
                .context("flushing snapshot store")?;
        }

        Ok(())
    }

    /// Create the reconciler with a reset counter wired to metrics.
    fn create_reconciler(&self) -> Arc<CounterReconciler> {
        let health = Arc::clone(&self.health);
        Arc::new(
            CounterReconciler::new().with_reset_callback(Box::new(move |_relay| {
                health.counter_resets.inc();
            })),
        )
    }

    /// Create a relay client with metrics callback.
    fn create_relay_client(&self) -> Result<HttpRelayClient> {
        let client = HttpRelayClient::new(&self.cfg.relay).context("creating relay client")?;

        let health = Arc::clone(&self.health);
        let client = client.with_metrics(Box::new(move |_outcome, duration| {
            health
                .relay_request_duration
                .observe(duration.as_secs_f64());
        }));

        Ok(client)
    }
}
