use anyhow::Result;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

/// Prometheus metrics for service health and observability.
///
/// All metrics use the "relaystats" namespace.
pub struct HealthMetrics {
    registry: Registry,

    /// Total polling cycles completed.
    pub cycles: Counter,
    /// Relays returned by discovery in the last cycle.
    pub relays_discovered: Gauge,
    /// Relays that answered in the last cycle.
    pub relays_fetched: Gauge,
    /// Relay fetch failures by kind (unreachable/timeout/malformed).
    pub relay_fetch_errors: CounterVec,
    /// Relay status request duration.
    pub relay_request_duration: Histogram,
    /// Counter resets detected across all relays.
    pub counter_resets: Counter,
    /// Snapshots written to storage.
    pub snapshots_persisted: Counter,
    /// Snapshot writes that failed.
    pub snapshot_persist_errors: Counter,
    /// Directory refreshes that failed with no cached list to fall back on.
    pub discovery_errors: Counter,
    /// Wall time of a full polling cycle.
    pub cycle_duration: Histogram,
    /// Export cycles dropped because the queue was full.
    pub export_dropped: Counter,
    /// Export requests that failed.
    pub export_errors: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let cycles = Counter::with_opts(
            Opts::new("cycles_total", "Total polling cycles completed.").namespace("relaystats"),
        )?;
        let relays_discovered = Gauge::with_opts(
            Opts::new(
                "relays_discovered",
                "Relays returned by discovery in the last cycle.",
            )
            .namespace("relaystats"),
        )?;
        let relays_fetched = Gauge::with_opts(
            Opts::new(
                "relays_fetched",
                "Relays that answered in the last cycle.",
            )
            .namespace("relaystats"),
        )?;
        let relay_fetch_errors = CounterVec::new(
            Opts::new(
                "relay_fetch_errors_total",
                "Relay fetch failures by kind.",
            )
            .namespace("relaystats"),
            &["kind"],
        )?;
        let relay_request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "relay_request_duration_seconds",
                "Relay status request duration in seconds.",
            )
            .namespace("relaystats")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 3.0, 5.0]),
        )?;
        let counter_resets = Counter::with_opts(
            Opts::new(
                "counter_resets_total",
                "Relay counter resets detected.",
            )
            .namespace("relaystats"),
        )?;
        let snapshots_persisted = Counter::with_opts(
            Opts::new(
                "snapshots_persisted_total",
                "Snapshots written to storage.",
            )
            .namespace("relaystats"),
        )?;
        let snapshot_persist_errors = Counter::with_opts(
            Opts::new(
                "snapshot_persist_errors_total",
                "Snapshot writes that failed.",
            )
            .namespace("relaystats"),
        )?;
        let discovery_errors = Counter::with_opts(
            Opts::new(
                "discovery_errors_total",
                "Relay directory failures with no cached list.",
            )
            .namespace("relaystats"),
        )?;
        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "cycle_duration_seconds",
                "Wall time of a polling cycle in seconds.",
            )
            .namespace("relaystats")
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.0, 3.0, 5.0, 10.0]),
        )?;
        let export_dropped = Counter::with_opts(
            Opts::new(
                "export_dropped_total",
                "Export cycles dropped because the queue was full.",
            )
            .namespace("relaystats"),
        )?;
        let export_errors = Counter::with_opts(
            Opts::new("export_errors_total", "Export requests that failed.")
                .namespace("relaystats"),
        )?;

        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(relays_discovered.clone()))?;
        registry.register(Box::new(relays_fetched.clone()))?;
        registry.register(Box::new(relay_fetch_errors.clone()))?;
        registry.register(Box::new(relay_request_duration.clone()))?;
        registry.register(Box::new(counter_resets.clone()))?;
        registry.register(Box::new(snapshots_persisted.clone()))?;
        registry.register(Box::new(snapshot_persist_errors.clone()))?;
        registry.register(Box::new(discovery_errors.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;
        registry.register(Box::new(export_dropped.clone()))?;
        registry.register(Box::new(export_errors.clone()))?;

        Ok(Self {
            registry,
            cycles,
            relays_discovered,
            relays_fetched,
            relay_fetch_errors,
            relay_request_duration,
            counter_resets,
            snapshots_persisted,
            snapshot_persist_errors,
            discovery_errors,
            cycle_duration,
            export_dropped,
            export_errors,
        })
    }

    /// Returns the registry holding all metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;

        Ok(String::from_utf8(buffer)?)
    }
}
