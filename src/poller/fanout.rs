use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::debug;

use crate::relay::{FetchError, RelayAddress, RelayClient, RelayStatus};

/// Outcome of one fan-out round. Complete only once every fetch resolved.
#[derive(Debug, Default)]
pub struct FanOutResult {
    /// Successful observations keyed by relay id.
    pub statuses: BTreeMap<String, RelayStatus>,
    /// Relays that did not contribute this cycle.
    pub failures: Vec<(String, FetchError)>,
}

impl FanOutResult {
    /// Number of relays that were queried.
    pub fn attempted(&self) -> usize {
        self.statuses.len() + self.failures.len()
    }
}

/// Query every relay concurrently and wait for all of them.
///
/// One task per relay, no cap. A failed relay is recorded in `failures` and
/// left out of `statuses`. Duplicate relay ids are fetched once.
pub async fn fetch_all<C: RelayClient>(client: Arc<C>, relays: &[RelayAddress]) -> FanOutResult {
    let mut tasks = JoinSet::new();
    let mut seen = HashSet::with_capacity(relays.len());

    for relay in relays {
        if !seen.insert(relay.id()) {
            continue;
        }

        let client = Arc::clone(&client);
        let relay = relay.clone();
        tasks.spawn(async move {
            let result = client.fetch_status(&relay).await;
            (relay, result)
        });
    }

    let mut result = FanOutResult::default();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((relay, Ok(status))) => {
                result.statuses.insert(relay.id().to_string(), status);
            }
            Ok((relay, Err(e))) => {
                debug!(relay = %relay, error = %e, "relay fetch failed");
                result.failures.push((relay.id().to_string(), e));
            }
            Err(e) => {
                // A panicking fetch loses its relay id; it still just drops out.
                debug!(error = %e, "relay fetch task failed");
            }
        }
    }

    result
}
