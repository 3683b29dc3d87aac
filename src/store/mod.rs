//! Durable, timestamp-keyed snapshot history.
//!
//! Layout inside the `TIMESTATS` tree:
//!
//! ```text
//! 2024-01-02T03:04:05.678Z               -> {"relays": 2}        (cycle header)
//! 2024-01-02T03:04:05.678Z/1.2.3.4:22067 -> RelayStatus JSON
//! 2024-01-02T03:04:05.678Z/5.6.7.8:443   -> RelayStatus JSON
//! ```
//!
//! Keys are fixed-width RFC3339 UTC timestamps, so byte order is
//! chronological order. Each cycle is written as a single atomic batch.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::relay::RelayStatus;

/// Name of the tree holding all cycles.
pub const TIMESTATS: &str = "TIMESTATS";

/// Separator between the cycle timestamp and the relay id.
const KEY_SEPARATOR: char = '/';

/// Length of a snapshot key (`YYYY-MM-DDTHH:MM:SS.mmmZ`).
const TIMESTAMP_LEN: usize = 24;

/// Snapshot store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("snapshot storage unavailable: {0}")]
    Unavailable(#[from] sled::Error),
    #[error("no snapshot stored yet")]
    NotFound,
    #[error("corrupt snapshot record {key:?}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("snapshot {key} is not newer than latest {latest}")]
    OutOfOrder { key: String, latest: String },
}

/// Cycle header stored under the bare timestamp key.
#[derive(Debug, Serialize, Deserialize)]
struct CycleHeader {
    relays: usize,
}

/// One relay's stored observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Status(RelayStatus),
    /// Stored value that no longer decodes; carries the decode error.
    Invalid(String),
}

/// A stored relay observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub relay: String,
    pub record: Record,
}

/// One completed polling cycle as read back from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// RFC3339 timestamp key.
    pub key: String,
    /// Entries ordered by relay id.
    pub entries: Vec<SnapshotEntry>,
}

impl Snapshot {
    /// Decodable entries as `(relay, status)` pairs.
    pub fn statuses(&self) -> impl Iterator<Item = (&str, &RelayStatus)> {
        self.entries.iter().filter_map(|e| match &e.record {
            Record::Status(status) => Some((e.relay.as_str(), status)),
            Record::Invalid(_) => None,
        })
    }

    /// Number of stored relay entries, including undecodable ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Format a cycle time as a snapshot key.
pub fn snapshot_key(taken_at: DateTime<Utc>) -> String {
    taken_at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// sled-backed snapshot store.
///
/// sled serializes writers internally while readers proceed without blocking;
/// `append` is only ever called from the polling loop.
pub struct SnapshotStore {
    db: sled::Db,
    stats: sled::Tree,
    append_lock: Mutex<()>,
}

impl SnapshotStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(sled::Error::Io(e)))?;
            }
        }

        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Open a throwaway store that is removed on drop.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let stats = db.open_tree(TIMESTATS)?;
        Ok(Self {
            db,
            stats,
            append_lock: Mutex::new(()),
        })
    }

    /// Persist one cycle's observations under its timestamp.
    ///
    /// Returns the snapshot key. Fails with `OutOfOrder` unless the key is
    /// strictly newer than the latest stored snapshot.
    pub fn append(
        &self,
        taken_at: DateTime<Utc>,
        relays: &BTreeMap<String, RelayStatus>,
    ) -> Result<String, StoreError> {
        let key = snapshot_key(taken_at);

        let _guard = self.append_lock.lock();

        if let Some(latest) = self.latest_key()? {
            if key.as_str() <= latest.as_str() {
                return Err(StoreError::OutOfOrder { key, latest });
            }
        }

        let mut batch = sled::Batch::default();

        let header = serde_json::to_vec(&CycleHeader {
            relays: relays.len(),
        })
        .map_err(|e| corrupt(&key, &e))?;
        batch.insert(key.as_bytes(), header);

        for (relay, status) in relays {
            let value = serde_json::to_vec(status).map_err(|e| corrupt(&key, &e))?;
            batch.insert(entry_key(&key, relay).into_bytes(), value);
        }

        self.stats.apply_batch(batch)?;
        self.stats.flush()?;

        debug!(key = %key, relays = relays.len(), "snapshot appended");

        Ok(key)
    }

    /// The most recently appended snapshot.
    pub fn latest(&self) -> Result<Snapshot, StoreError> {
        let key = self.latest_key()?.ok_or(StoreError::NotFound)?;
        self.read_snapshot(&key)
    }

    /// Key of the most recent snapshot, if any.
    pub fn latest_key(&self) -> Result<Option<String>, StoreError> {
        match self.stats.last()? {
            Some((k, _)) => Ok(Some(timestamp_of(&k)?)),
            None => Ok(None),
        }
    }

    /// Read one snapshot by key.
    pub fn read_snapshot(&self, key: &str) -> Result<Snapshot, StoreError> {
        let mut snapshot = Snapshot {
            key: key.to_string(),
            entries: Vec::new(),
        };
        let mut found = false;

        for item in self.stats.scan_prefix(key.as_bytes()) {
            let (k, v) = item?;
            found = true;
            if let Some(entry) = decode_entry(key, &k, &v)? {
                snapshot.entries.push(entry);
            }
        }

        if !found {
            return Err(StoreError::NotFound);
        }

        Ok(snapshot)
    }

    /// Every stored snapshot, oldest first.
    ///
    /// Lazy: reads one cycle at a time. Restart by calling again.
    pub fn all_in_order(&self) -> SnapshotIter {
        SnapshotIter {
            inner: self.stats.iter(),
            pending: None,
            done: false,
        }
    }

    /// Stored snapshot keys with their relay counts, oldest first.
    pub fn index(&self) -> Result<Vec<(String, usize)>, StoreError> {
        self.all_in_order()
            .map(|snapshot| snapshot.map(|s| (s.key.clone(), s.len())))
            .collect()
    }

    /// Write a raw tree entry, bypassing encoding.
    #[cfg(test)]
    pub(crate) fn insert_raw(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.stats.insert(key.as_bytes(), value)?;
        Ok(())
    }

    /// Approximate on-disk size in bytes.
    pub fn size_on_disk(&self) -> Result<u64, StoreError> {
        Ok(self.db.size_on_disk()?)
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Lazy chronological iterator over stored snapshots.
pub struct SnapshotIter {
    inner: sled::Iter,
    pending: Option<(sled::IVec, sled::IVec)>,
    done: bool,
}

impl Iterator for SnapshotIter {
    type Item = Result<Snapshot, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let first = match self.pending.take() {
            Some(kv) => kv,
            None => match self.inner.next()? {
                Ok(kv) => kv,
                Err(e) => return Some(self.fail(e.into())),
            },
        };

        let key = match timestamp_of(&first.0) {
            Ok(key) => key,
            Err(e) => return Some(self.fail(e)),
        };

        let mut snapshot = Snapshot {
            key,
            entries: Vec::new(),
        };

        if let Err(e) = push_entry(&mut snapshot, &first.0, &first.1) {
            return Some(self.fail(e));
        }

        loop {
            match self.inner.next() {
                Some(Ok((k, v))) => {
                    if !k.starts_with(snapshot.key.as_bytes()) {
                        self.pending = Some((k, v));
                        break;
                    }
                    if let Err(e) = push_entry(&mut snapshot, &k, &v) {
                        return Some(self.fail(e));
                    }
                }
                Some(Err(e)) => return Some(self.fail(e.into())),
                None => break,
            }
        }

        Some(Ok(snapshot))
    }
}

impl SnapshotIter {
    fn fail(&mut self, err: StoreError) -> Result<Snapshot, StoreError> {
        self.done = true;
        Err(err)
    }
}

fn push_entry(snapshot: &mut Snapshot, k: &[u8], v: &[u8]) -> Result<(), StoreError> {
    if let Some(entry) = decode_entry(&snapshot.key, k, v)? {
        snapshot.entries.push(entry);
    }
    Ok(())
}

pub(crate) fn entry_key(snapshot_key: &str, relay: &str) -> String {
    format!("{snapshot_key}{KEY_SEPARATOR}{relay}")
}

/// Extract the snapshot timestamp from a raw tree key.
fn timestamp_of(raw: &[u8]) -> Result<String, StoreError> {
    let key = std::str::from_utf8(raw).map_err(|e| corrupt(&String::from_utf8_lossy(raw), &e))?;

    match key.get(..TIMESTAMP_LEN) {
        Some(ts) if key.len() == TIMESTAMP_LEN || key[TIMESTAMP_LEN..].starts_with(KEY_SEPARATOR) => {
            Ok(ts.to_string())
        }
        _ => Err(StoreError::Corrupt {
            key: key.to_string(),
            reason: "not a snapshot key".to_string(),
        }),
    }
}

/// Decode one tree entry; `None` for the cycle header.
fn decode_entry(
    snapshot_key: &str,
    k: &[u8],
    v: &[u8],
) -> Result<Option<SnapshotEntry>, StoreError> {
    let key = String::from_utf8_lossy(k);
    let Some(rest) = key.strip_prefix(snapshot_key) else {
        return Err(StoreError::Corrupt {
            key: key.into_owned(),
            reason: format!("outside snapshot {snapshot_key}"),
        });
    };

    if rest.is_empty() {
        return Ok(None);
    }

    let Some(relay) = rest.strip_prefix(KEY_SEPARATOR) else {
        return Err(StoreError::Corrupt {
            key: key.into_owned(),
            reason: "missing relay separator".to_string(),
        });
    };

    let record = match serde_json::from_slice::<RelayStatus>(v) {
        Ok(status) => Record::Status(status),
        Err(e) => Record::Invalid(format!("undecodable record: {e}")),
    };

    Ok(Some(SnapshotEntry {
        relay: relay.to_string(),
        record,
    }))
}

fn corrupt(key: &str, err: &dyn std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: err.to_string(),
    }
}
