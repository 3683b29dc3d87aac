//! Cumulative traffic accounting across relay counter resets.
//!
//! Relays report a monotonically increasing `bytesProxied` counter that drops
//! back towards zero whenever the relay process restarts. The reconciler keeps
//! per-relay history so the adjusted value (`base_offset + raw`) never
//! decreases.
//!
//! Mutation happens only from the polling loop. Readers use offset
//! generations checkpointed per snapshot key, so a render of snapshot N is
//! never adjusted with offsets derived from a later cycle.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::relay::RelayStatus;
use crate::store::{Snapshot, StoreError};

/// Number of checkpointed offset generations retained for readers.
const MAX_GENERATIONS: usize = 8;

/// Per-relay accounting state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayHistory {
    /// Bytes attributable to counter epochs that ended in a reset.
    pub base_offset: u64,
    /// Most recent raw counter value.
    pub last_observed: u64,
}

impl RelayHistory {
    /// Fold one raw observation into the history, returning the adjusted value
    /// and whether a reset was detected.
    pub fn observe(&mut self, raw: u64) -> (u64, bool) {
        let reset = raw < self.last_observed;
        if reset {
            self.base_offset += self.last_observed;
        }
        self.last_observed = raw;
        (self.base_offset + raw, reset)
    }

    /// The adjusted cumulative value as of the last observation.
    pub fn adjusted(&self) -> u64 {
        self.base_offset + self.last_observed
    }
}

/// Base offsets frozen at the moment a snapshot was taken.
#[derive(Debug, Clone, Default)]
pub struct OffsetTable {
    snapshot_key: String,
    offsets: HashMap<String, u64>,
}

impl OffsetTable {
    /// The snapshot key this generation belongs to.
    pub fn snapshot_key(&self) -> &str {
        &self.snapshot_key
    }

    /// Base offset for a relay; zero for relays never reset.
    pub fn base_offset(&self, relay: &str) -> u64 {
        self.offsets.get(relay).copied().unwrap_or(0)
    }
}

/// Callback invoked with the relay id whenever a reset is detected.
pub type ResetCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Maintains reset-compensated cumulative counters for every relay.
pub struct CounterReconciler {
    histories: RwLock<HashMap<String, RelayHistory>>,
    generations: RwLock<BTreeMap<String, Arc<OffsetTable>>>,
    on_reset: Option<ResetCallback>,
}

impl Default for CounterReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CounterReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterReconciler")
            .field("relays", &self.histories.read().len())
            .field("generations", &self.generations.read().len())
            .finish()
    }
}

impl CounterReconciler {
    pub fn new() -> Self {
        Self {
            histories: RwLock::new(HashMap::new()),
            generations: RwLock::new(BTreeMap::new()),
            on_reset: None,
        }
    }

    /// Set a callback fired for each detected counter reset.
    pub fn with_reset_callback(mut self, cb: ResetCallback) -> Self {
        self.on_reset = Some(cb);
        self
    }

    /// Fold a fresh observation into the relay's history and return the
    /// adjusted cumulative byte count.
    pub fn reconcile(&self, relay: &str, raw: &RelayStatus) -> u64 {
        let (adjusted, reset, base_offset) = {
            let mut histories = self.histories.write();
            let history = histories.entry(relay.to_string()).or_default();
            let (adjusted, reset) = history.observe(raw.bytes_proxied);
            (adjusted, reset, history.base_offset)
        };

        if reset {
            debug!(
                relay,
                raw = raw.bytes_proxied,
                base_offset,
                "counter reset detected",
            );
            if let Some(ref cb) = self.on_reset {
                cb(relay);
            }
        }

        adjusted
    }

    /// Current history for a relay.
    pub fn history(&self, relay: &str) -> Option<RelayHistory> {
        self.histories.read().get(relay).copied()
    }

    /// Copy of all relay histories.
    pub fn histories(&self) -> HashMap<String, RelayHistory> {
        self.histories.read().clone()
    }

    /// Freeze the current base offsets under a snapshot key.
    ///
    /// Called after a cycle is reconciled and before it is persisted. Returns
    /// the generation previously stored under the same key, for `discard`.
    pub fn checkpoint(&self, snapshot_key: &str) -> Option<Arc<OffsetTable>> {
        let offsets = self
            .histories
            .read()
            .iter()
            .filter(|(_, h)| h.base_offset > 0)
            .map(|(relay, h)| (relay.clone(), h.base_offset))
            .collect();

        let table = Arc::new(OffsetTable {
            snapshot_key: snapshot_key.to_string(),
            offsets,
        });

        let mut generations = self.generations.write();
        let replaced = generations.insert(snapshot_key.to_string(), table);
        while generations.len() > MAX_GENERATIONS {
            generations.pop_first();
        }
        replaced
    }

    /// Roll back a checkpoint whose snapshot failed to persist.
    ///
    /// `replaced` is what `checkpoint` returned. A generation that belongs to
    /// an already persisted snapshot with the same key is put back.
    pub fn discard(&self, snapshot_key: &str, replaced: Option<Arc<OffsetTable>>) {
        let mut generations = self.generations.write();
        match replaced {
            Some(table) => {
                generations.insert(snapshot_key.to_string(), table);
            }
            None => {
                generations.remove(snapshot_key);
            }
        }
    }

    /// Offsets to apply to the raw values of the given snapshot.
    ///
    /// Uses the exact generation when available, else the newest generation
    /// not newer than the snapshot, else all zeros.
    pub fn offsets_for(&self, snapshot_key: &str) -> Arc<OffsetTable> {
        let generations = self.generations.read();
        generations
            .range::<str, _>((Bound::Unbounded, Bound::Included(snapshot_key)))
            .next_back()
            .map(|(_, table)| Arc::clone(table))
            .unwrap_or_default()
    }

    /// Rebuild history from stored snapshots, oldest first.
    ///
    /// Records that fail to decode are skipped. The last replayed snapshot is
    /// checkpointed so the view can render it immediately.
    pub fn replay<I>(&self, snapshots: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = Result<Snapshot, StoreError>>,
    {
        let mut replayed = 0usize;
        let mut last_key = None;

        for snapshot in snapshots {
            let snapshot = snapshot?;
            for (relay, status) in snapshot.statuses() {
                self.reconcile(relay, status);
            }
            last_key = Some(snapshot.key);
            replayed += 1;
        }

        if let Some(key) = last_key {
            self.checkpoint(&key);
            info!(
                snapshots = replayed,
                relays = self.histories.read().len(),
                latest = %key,
                "replayed counter history",
            );
        }

        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::store::{entry_key, SnapshotStore};

    fn status(bytes: u64) -> RelayStatus {
        RelayStatus {
            bytes_proxied: bytes,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_observation_is_raw_value() {
        let reconciler = CounterReconciler::new();
        assert_eq!(reconciler.reconcile("r1", &status(500)), 500);
        assert_eq!(
            reconciler.history("r1"),
            Some(RelayHistory {
                base_offset: 0,
                last_observed: 500
            })
        );
    }

    #[test]
    fn test_reset_sequence() {
        let reconciler = CounterReconciler::new();
        let adjusted: Vec<u64> = [100, 150, 200, 40, 90]
            .iter()
            .map(|&raw| reconciler.reconcile("r1", &status(raw)))
            .collect();
        assert_eq!(adjusted, vec![100, 150, 200, 240, 290]);
        assert_eq!(
            reconciler.history("r1"),
            Some(RelayHistory {
                base_offset: 200,
                last_observed: 90
            })
        );
    }

    #[test]
    fn test_repeated_resets_accumulate() {
        let mut history = RelayHistory::default();
        let adjusted: Vec<u64> = [50, 10, 5, 0, 30]
            .iter()
            .map(|&raw| history.observe(raw).0)
            .collect();
        assert_eq!(adjusted, vec![50, 60, 65, 65, 95]);
        assert_eq!(history.adjusted(), 95);
    }

    #[test]
    fn test_adjusted_never_decreases() {
        // Deterministic pseudo-random walk with frequent restarts.
        let mut state = 0x9e37_79b9_7f4a_7c15_u64;
        let mut raw = 0u64;
        let reconciler = CounterReconciler::new();
        let mut previous = 0u64;

        for _ in 0..10_000 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            if state % 7 == 0 {
                raw = state % 1_000;
            } else {
                raw += state % 10_000;
            }

            let adjusted = reconciler.reconcile("r1", &status(raw));
            assert!(adjusted >= previous, "{adjusted} < {previous}");
            previous = adjusted;
        }
    }

    #[test]
    fn test_relays_are_independent() {
        let reconciler = CounterReconciler::new();
        reconciler.reconcile("a", &status(100));
        reconciler.reconcile("b", &status(1_000));
        reconciler.reconcile("a", &status(10));

        assert_eq!(reconciler.history("a").map(|h| h.base_offset), Some(100));
        assert_eq!(reconciler.history("b").map(|h| h.base_offset), Some(0));
        assert!(reconciler.history("c").is_none());
    }

    #[test]
    fn test_reset_callback_fires() {
        let resets = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&resets);
        let reconciler = CounterReconciler::new().with_reset_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        for raw in [10, 20, 5, 6, 1] {
            reconciler.reconcile("r1", &status(raw));
        }
        assert_eq!(resets.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_offsets_for_uses_matching_generation() {
        let reconciler = CounterReconciler::new();

        reconciler.reconcile("r1", &status(200));
        reconciler.checkpoint("2024-01-01T00:00:05.000Z");

        // Cycle 2 observes a reset but its snapshot is not visible yet.
        reconciler.reconcile("r1", &status(40));
        reconciler.checkpoint("2024-01-01T00:00:10.000Z");

        let old = reconciler.offsets_for("2024-01-01T00:00:05.000Z");
        assert_eq!(old.base_offset("r1"), 0);

        let new = reconciler.offsets_for("2024-01-01T00:00:10.000Z");
        assert_eq!(new.base_offset("r1"), 200);
        assert_eq!(new.snapshot_key(), "2024-01-01T00:00:10.000Z");
    }

    #[test]
    fn test_offsets_for_falls_back_to_older_generation() {
        let reconciler = CounterReconciler::new();
        reconciler.reconcile("r1", &status(200));
        reconciler.reconcile("r1", &status(1));
        reconciler.checkpoint("2024-01-01T00:00:05.000Z");

        let table = reconciler.offsets_for("2024-01-01T00:00:07.000Z");
        assert_eq!(table.base_offset("r1"), 200);

        let none = reconciler.offsets_for("2023-12-31T23:59:59.000Z");
        assert_eq!(none.base_offset("r1"), 0);
    }

    #[test]
    fn test_discard_removes_generation() {
        let reconciler = CounterReconciler::new();
        reconciler.reconcile("r1", &status(200));
        reconciler.reconcile("r1", &status(1));
        let replaced = reconciler.checkpoint("2024-01-01T00:00:05.000Z");
        assert!(replaced.is_none());
        reconciler.discard("2024-01-01T00:00:05.000Z", replaced);

        let table = reconciler.offsets_for("2024-01-01T00:00:05.000Z");
        assert_eq!(table.base_offset("r1"), 0);
    }

    #[test]
    fn test_discard_restores_generation_of_persisted_key() {
        let reconciler = CounterReconciler::new();
        reconciler.reconcile("r1", &status(200));
        reconciler.checkpoint("2024-01-01T00:00:05.000Z");

        // Reset observed and persisted under 00:00:10.
        reconciler.reconcile("r1", &status(40));
        reconciler.checkpoint("2024-01-01T00:00:10.000Z");

        // A later cycle lands on the same key and its write is refused.
        reconciler.reconcile("r1", &status(50));
        let replaced = reconciler.checkpoint("2024-01-01T00:00:10.000Z");
        assert!(replaced.is_some());
        reconciler.discard("2024-01-01T00:00:10.000Z", replaced);

        let table = reconciler.offsets_for("2024-01-01T00:00:10.000Z");
        assert_eq!(table.base_offset("r1"), 200);
        assert_eq!(table.snapshot_key(), "2024-01-01T00:00:10.000Z");
    }

    #[test]
    fn test_replay_skips_undecodable_records() {
        let at = |secs| Utc.timestamp_opt(secs, 0).single().expect("valid timestamp");
        let cycle = |relays: &[(&str, u64)]| -> BTreeMap<String, RelayStatus> {
            relays
                .iter()
                .map(|&(relay, bytes)| (relay.to_string(), status(bytes)))
                .collect()
        };

        let store = SnapshotStore::temporary().expect("store");
        store
            .append(at(1_700_000_000), &cycle(&[("a:1", 100), ("b:2", 100)]))
            .expect("append");
        let key = store
            .append(at(1_700_000_005), &cycle(&[("a:1", 10)]))
            .expect("append");
        store
            .insert_raw(&entry_key(&key, "b:2"), b"{not json")
            .expect("raw insert");
        store
            .append(at(1_700_000_010), &cycle(&[("a:1", 20), ("b:2", 20)]))
            .expect("append");

        let reconciler = CounterReconciler::new();
        let replayed = reconciler.replay(store.all_in_order()).expect("replay");
        assert_eq!(replayed, 3);

        // a:1 resets at the second cycle; b:2's garbage record is not observed.
        assert_eq!(
            reconciler.history("a:1"),
            Some(RelayHistory {
                base_offset: 100,
                last_observed: 20
            })
        );
        assert_eq!(
            reconciler.history("b:2"),
            Some(RelayHistory {
                base_offset: 100,
                last_observed: 20
            })
        );
    }

    #[test]
    fn test_generations_are_bounded() {
        let reconciler = CounterReconciler::new();
        for i in 0..(MAX_GENERATIONS + 5) {
            reconciler.checkpoint(&format!("2024-01-01T00:00:{i:02}.000Z"));
        }
        assert_eq!(reconciler.generations.read().len(), MAX_GENERATIONS);
    }
}
