use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::store::LedgerStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact the store once `threshold` appends have piled up since the last rewrite.
/// Also prunes watch channels nobody listens to anymore. Returns whether a
/// compaction ran.
pub async fn compact_if_due(store: &LedgerStore, threshold: u64) -> bool {
    let pruned = store.notify().prune();
    if pruned > 0 {
        debug!("pruned {pruned} idle watch channels");
    }
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact().await {
        Ok(()) => true,
        Err(e) => {
            warn!("WAL compaction after {appends} appends failed: {e}");
            false
        }
    }
}

/// Background loop; runs for the life of the process.
pub async fn run_compactor(store: Arc<LedgerStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}
