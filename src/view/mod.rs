pub mod html;

use std::sync::Arc;

use serde::Serialize;

use crate::reconcile::CounterReconciler;
use crate::relay::RATE_WINDOWS;
use crate::store::{Record, SnapshotStore, StoreError};

/// One relay row as displayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayRow {
    pub relay: String,
    #[serde(flatten)]
    pub data: RowData,
}

/// Either the relay's adjusted figures or the reason they are missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowData {
    Stats(RelayFigures),
    Error(String),
}

/// Figures shown for a relay (and for the totals row).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayFigures {
    /// Adjusted cumulative bytes proxied.
    pub bytes_proxied: u64,
    pub num_active_sessions: u64,
    pub num_connections: u64,
    pub rates: [u64; RATE_WINDOWS],
    #[serde(skip_serializing_if = "String::is_empty")]
    pub provided_by: String,
}

impl RelayFigures {
    fn add(&mut self, other: &RelayFigures) {
        self.bytes_proxied += other.bytes_proxied;
        self.num_active_sessions += other.num_active_sessions;
        self.num_connections += other.num_connections;
        for (total, rate) in self.rates.iter_mut().zip(other.rates.iter()) {
            *total += rate;
        }
    }
}

/// The latest snapshot, adjusted for counter resets, with fleet totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregatedView {
    /// Key of the rendered snapshot; `None` before the first cycle.
    pub snapshot: Option<String>,
    pub relays: Vec<RelayRow>,
    pub totals: RelayFigures,
}

impl AggregatedView {
    /// Number of rows carrying figures.
    pub fn reporting(&self) -> usize {
        self.relays
            .iter()
            .filter(|r| matches!(r.data, RowData::Stats(_)))
            .count()
    }
}

/// Read-side aggregation over the snapshot store and reconciler state.
#[derive(Clone)]
pub struct AggregationView {
    store: Arc<SnapshotStore>,
    reconciler: Arc<CounterReconciler>,
}

impl AggregationView {
    pub fn new(store: Arc<SnapshotStore>, reconciler: Arc<CounterReconciler>) -> Self {
        Self { store, reconciler }
    }

    /// Build the view for the most recent snapshot.
    ///
    /// An empty store yields an empty view. Offsets are looked up, never
    /// re-reconciled.
    pub fn render(&self) -> Result<AggregatedView, StoreError> {
        let snapshot = match self.store.latest() {
            Ok(snapshot) => snapshot,
            Err(StoreError::NotFound) => return Ok(AggregatedView::default()),
            Err(e) => return Err(e),
        };

        let offsets = self.reconciler.offsets_for(&snapshot.key);

        let mut view = AggregatedView {
            snapshot: Some(snapshot.key.clone()),
            relays: Vec::with_capacity(snapshot.len()),
            totals: RelayFigures::default(),
        };

        for entry in snapshot.entries {
            let data = match entry.record {
                Record::Status(status) => {
                    let figures = RelayFigures {
                        bytes_proxied: status.bytes_proxied + offsets.base_offset(&entry.relay),
                        num_active_sessions: status.num_active_sessions,
                        num_connections: status.num_connections,
                        rates: status.rates,
                        provided_by: status.options.provided_by,
                    };
                    view.totals.add(&figures);
                    RowData::Stats(figures)
                }
                Record::Invalid(reason) => RowData::Error(reason),
            };

            view.relays.push(RelayRow {
                relay: entry.relay,
                data,
            });
        }

        Ok(view)
    }
}
