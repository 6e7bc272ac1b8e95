use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact `engine`'s WAL whenever `threshold` appends have piled up since the
/// last compaction. Exits once the engine is dropped.
pub async fn run_compactor(engine: Weak<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let Some(engine) = engine.upgrade() else {
            return;
        };
        compact_if_needed(&engine, threshold).await;
    }
}

/// Returns true if a compaction ran and succeeded.
pub async fn compact_if_needed(engine: &Arc<Engine>, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            metrics::counter!(crate::observability::COMPACTIONS_TOTAL).increment(1);
            info!(appends, "compacted WAL");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "WAL compaction failed");
            false
        }
    }
}
