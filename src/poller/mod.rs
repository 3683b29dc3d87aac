//! The polling cycle: discover, fan out, reconcile, persist, export.

pub mod fanout;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::discovery::{DirectoryClient, DiscoveryCache};
use crate::export::health::HealthMetrics;
use crate::export::influx::InfluxExporter;
use crate::reconcile::CounterReconciler;
use crate::relay::RelayClient;
use crate::store::{snapshot_key, SnapshotStore};

/// Summary of one completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Relays returned by discovery.
    pub discovered: usize,
    /// Relays that answered.
    pub fetched: usize,
    /// Relays dropped from this cycle.
    pub failed: usize,
    /// Snapshot key, if the cycle was persisted.
    pub snapshot: Option<String>,
}

/// Drives polling cycles. The only writer of reconciler state and the store.
pub struct Poller<C, D> {
    client: Arc<C>,
    discovery: Arc<DiscoveryCache<D>>,
    reconciler: Arc<CounterReconciler>,
    store: Arc<SnapshotStore>,
    health: Arc<HealthMetrics>,
    exporter: Option<Arc<InfluxExporter>>,
    cycles: AtomicU64,
}

impl<C, D> Poller<C, D>
where
    C: RelayClient,
    D: DirectoryClient + 'static,
{
    pub fn new(
        client: Arc<C>,
        discovery: Arc<DiscoveryCache<D>>,
        reconciler: Arc<CounterReconciler>,
        store: Arc<SnapshotStore>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            client,
            discovery,
            reconciler,
            store,
            health,
            exporter: None,
            cycles: AtomicU64::new(0),
        }
    }

    /// Forward each cycle's rates to an external sink.
    pub fn with_exporter(mut self, exporter: Arc<InfluxExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Run one full cycle. Failures are absorbed; the report says what happened.
    pub async fn run_cycle(&self) -> CycleReport {
        let start = Instant::now();

        let relays = match self.discovery.list_relays().await {
            Ok(relays) => relays,
            Err(e) => {
                warn!(error = %e, "no relay list available, polling nothing this cycle");
                self.health.discovery_errors.inc();
                Vec::new()
            }
        };
        self.health.relays_discovered.set(relays.len() as f64);

        let result = fanout::fetch_all(Arc::clone(&self.client), &relays).await;

        for (_, e) in &result.failures {
            self.health
                .relay_fetch_errors
                .with_label_values(&[e.kind()])
                .inc();
        }

        for (relay, status) in &result.statuses {
            self.reconciler.reconcile(relay, status);
        }

        let taken_at = Utc::now();
        let key = snapshot_key(taken_at);
        let replaced = self.reconciler.checkpoint(&key);

        if let Some(exporter) = &self.exporter {
            exporter.export(taken_at, &result.statuses);
        }

        let fetched = result.statuses.len();
        let failed = result.failures.len();

        let store = Arc::clone(&self.store);
        let statuses = result.statuses;
        let persisted = match tokio::task::spawn_blocking(move || store.append(taken_at, &statuses))
            .await
        {
            Ok(result) => result.map_err(anyhow::Error::from),
            Err(e) => Err(anyhow::Error::from(e).context("snapshot persist task failed")),
        };

        let snapshot = match persisted {
            Ok(key) => {
                self.health.snapshots_persisted.inc();
                Some(key)
            }
            Err(e) => {
                self.reconciler.discard(&key, replaced);
                self.health.snapshot_persist_errors.inc();
                error!(key = %key, error = %format!("{e:#}"), "failed to persist snapshot");
                None
            }
        };

        let elapsed = start.elapsed();
        self.health.cycles.inc();
        self.health.relays_fetched.set(fetched as f64);
        self.health.cycle_duration.observe(elapsed.as_secs_f64());

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed);
        if cycle == 0 {
            info!(
                discovered = relays.len(),
                fetched,
                failed,
                elapsed_ms = elapsed.as_millis() as u64,
                "first polling cycle complete",
            );
        } else {
            debug!(
                cycle,
                discovered = relays.len(),
                fetched,
                failed,
                elapsed_ms = elapsed.as_millis() as u64,
                "polling cycle complete",
            );
        }

        CycleReport {
            discovered: relays.len(),
            fetched,
            failed,
            snapshot,
        }
    }

    /// Number of cycles run so far.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Run cycles on a fixed interval until `cancel` fires.
    ///
    /// The first cycle starts immediately. A cycle that overruns the interval
    /// skips the missed ticks instead of bursting.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        self.run_cycle().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::Result;
    use parking_lot::Mutex;

    use super::*;
    use crate::relay::{FetchError, RelayAddress, RelayStatus};
    use crate::view::AggregationView;

    /// Relay fleet whose answers can be changed between cycles.
    #[derive(Default)]
    struct FakeFleet {
        bytes: Mutex<HashMap<String, u64>>,
    }

    impl FakeFleet {
        fn set(&self, id: &str, bytes: Option<u64>) {
            let mut map = self.bytes.lock();
            match bytes {
                Some(b) => map.insert(id.to_string(), b),
                None => map.remove(id),
            };
        }
    }

    impl RelayClient for FakeFleet {
        async fn fetch_status(&self, relay: &RelayAddress) -> Result<RelayStatus, FetchError> {
            match self.bytes.lock().get(relay.id()) {
                Some(&bytes) => Ok(RelayStatus {
                    bytes_proxied: bytes,
                    num_active_sessions: 1,
                    rates: [1, 1, 1, 1, 1, 1],
                    ..Default::default()
                }),
                None => Err(FetchError::Unreachable("connection refused".to_string())),
            }
        }
    }

    struct StaticDirectory {
        relays: Vec<&'static str>,
        failing: bool,
    }

    impl DirectoryClient for StaticDirectory {
        async fn fetch_relays(&self) -> Result<Vec<RelayAddress>> {
            if self.failing {
                anyhow::bail!("directory down");
            }
            self.relays
                .iter()
                .map(|id| RelayAddress::parse(&format!("relay://{id}/?statusAddr=:22070")))
                .collect()
        }
    }

    struct Harness {
        fleet: Arc<FakeFleet>,
        store: Arc<SnapshotStore>,
        reconciler: Arc<CounterReconciler>,
        health: Arc<HealthMetrics>,
        poller: Arc<Poller<FakeFleet, StaticDirectory>>,
    }

    fn harness(relays: Vec<&'static str>, failing: bool) -> Harness {
        let fleet = Arc::new(FakeFleet::default());
        let store = Arc::new(SnapshotStore::temporary().expect("store"));
        let reconciler = Arc::new(CounterReconciler::new());
        let health = Arc::new(HealthMetrics::new().expect("metrics"));
        let discovery = Arc::new(DiscoveryCache::new(
            StaticDirectory { relays, failing },
            Duration::from_secs(60),
        ));
        let poller = Arc::new(Poller::new(
            Arc::clone(&fleet),
            discovery,
            Arc::clone(&reconciler),
            Arc::clone(&store),
            Arc::clone(&health),
        ));
        Harness {
            fleet,
            store,
            reconciler,
            health,
            poller,
        }
    }

    /// Keys carry millisecond precision; keep successive cycles apart.
    async fn next_millisecond() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    #[tokio::test]
    async fn test_failing_relay_absent_from_snapshot() {
        let h = harness(vec!["a:1", "b:2", "c:3"], false);
        h.fleet.set("a:1", Some(100));
        h.fleet.set("c:3", Some(300));

        let report = h.poller.run_cycle().await;
        assert_eq!(report.discovered, 3);
        assert_eq!(report.fetched, 2);
        assert_eq!(report.failed, 1);

        let latest = h.store.latest().expect("persisted");
        assert_eq!(Some(latest.key.clone()), report.snapshot);
        let relays: Vec<&str> = latest.statuses().map(|(r, _)| r).collect();
        assert_eq!(relays, vec!["a:1", "c:3"]);

        assert_eq!(
            h.health
                .relay_fetch_errors
                .with_label_values(&["unreachable"])
                .get(),
            1.0
        );
        assert_eq!(h.health.snapshots_persisted.get(), 1.0);
    }

    #[tokio::test]
    async fn test_discovery_outage_runs_empty_cycle() {
        let h = harness(vec![], true);

        let report = h.poller.run_cycle().await;
        assert_eq!(report.discovered, 0);
        assert!(report.snapshot.is_some());
        assert!(h.store.latest().expect("empty snapshot").is_empty());
        assert_eq!(h.health.discovery_errors.get(), 1.0);
    }

    #[tokio::test]
    async fn test_reset_is_reflected_in_view() {
        let h = harness(vec!["a:1"], false);
        let view = AggregationView::new(Arc::clone(&h.store), Arc::clone(&h.reconciler));

        for bytes in [100, 150, 200, 40, 90] {
            h.fleet.set("a:1", Some(bytes));
            h.poller.run_cycle().await;
            next_millisecond().await;
        }

        let rendered = view.render().expect("render");
        assert_eq!(rendered.totals.bytes_proxied, 290);
        assert_eq!(h.poller.cycles(), 5);
    }

    #[tokio::test]
    async fn test_snapshot_keys_strictly_increase() {
        let h = harness(vec!["a:1"], false);
        h.fleet.set("a:1", Some(1));

        let mut keys = Vec::new();
        for _ in 0..3 {
            keys.push(h.poller.run_cycle().await.snapshot.expect("persisted"));
            next_millisecond().await;
        }
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_spawned_loop_stops_on_cancel() {
        let h = harness(vec!["a:1"], false);
        h.fleet.set("a:1", Some(1));

        let cancel = CancellationToken::new();
        let handle = Arc::clone(&h.poller).spawn(Duration::from_secs(5), cancel.clone());

        // First tick fires immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        handle.await.expect("loop exits cleanly");

        assert!(h.poller.cycles() >= 1);
    }
}
