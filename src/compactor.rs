use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::{Engine, EngineError};
use crate::observability::WAL_COMPACTIONS_TOTAL;

/// Background task that rewrites the WAL as a snapshot once enough records
/// have piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            warn!("compaction failed: {e}");
        }
    }
}

/// Compact when at least `threshold` records were appended since the last
/// compaction. Returns whether it compacted.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appended = engine.wal_appends_since_compact().await;
    if appended < threshold.max(1) {
        return Ok(false);
    }
    engine.compact_wal().await?;
    metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
    info!(appended, "compacted WAL");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlaceDraft;

    fn draft(name: &str) -> PlaceDraft {
        PlaceDraft {
            name: name.into(),
            address: "1 Main St".into(),
            city: "Springfield".into(),
            state: "SP".into(),
            gates: None,
            turnstiles: None,
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let dir = std::env::temp_dir().join("gatehouse_test_compactor");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("threshold.wal");
        let engine = Engine::new(path.clone()).unwrap();

        engine.create_place(draft("A")).await.unwrap();
        engine.create_place(draft("B")).await.unwrap();
        assert!(!compact_if_due(&engine, 3).await.unwrap());

        engine.create_place(draft("C")).await.unwrap();
        assert!(compact_if_due(&engine, 3).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert!(!compact_if_due(&engine, 3).await.unwrap());

        drop(engine);
        let restored = Engine::new(path).unwrap();
        assert_eq!(restored.places.len(), 3);
    }
}
