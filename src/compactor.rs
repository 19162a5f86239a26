use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that rewrites a tenant's WAL once enough events have
/// accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        if let Err(e) = maybe_compact(&engine, threshold).await {
            tracing::warn!("compaction failed: {e}");
        }
    }
}

/// One compaction check. Compacts only when the append count since the
/// last compaction has reached the threshold.
pub async fn maybe_compact(engine: &Engine, threshold: u64) -> Result<(), crate::engine::EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(());
    }
    info!("compacting WAL ({appends} appends since last compaction)");
    engine.compact_wal().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TrialRequest;
    use crate::model::SlotKey;
    use crate::notify::NotifyHub;
    use chrono::{NaiveDate, NaiveTime};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("trialdesk_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn key(date: &str, time: &str) -> SlotKey {
        SlotKey {
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            time: NaiveTime::parse_from_str(time, "%H:%M").unwrap(),
        }
    }

    #[tokio::test]
    async fn compactor_skips_below_threshold() {
        let path = test_wal_path("below_threshold.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Engine::new(path.clone(), notify).unwrap();

        let tid = Ulid::new();
        engine
            .register_teacher(tid, "Mr Reyes".into(), "english".into())
            .await
            .unwrap();
        engine.publish_slot(tid, key("2026-09-01", "10:00")).await.unwrap();

        let before = std::fs::metadata(&path).unwrap().len();
        maybe_compact(&engine, 1000).await.unwrap();

        // Untouched: append counter is still below threshold
        assert!(engine.wal_appends_since_compact().await > 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), before);
    }

    #[tokio::test]
    async fn compactor_rewrites_at_threshold() {
        let path = test_wal_path("at_threshold.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Engine::new(path.clone(), notify).unwrap();

        let tid = Ulid::new();
        engine
            .register_teacher(tid, "Mr Reyes".into(), "english".into())
            .await
            .unwrap();
        for hour in 8..12 {
            engine
                .publish_slot(tid, key("2026-09-01", &format!("{hour:02}:00")))
                .await
                .unwrap();
        }
        engine
            .book_trial(TrialRequest {
                name: "Ana Garcia".into(),
                age: Some(9),
                phone: "+34600111222".into(),
                country: "ES".into(),
                platform: "web".into(),
                category: "english".into(),
                sales_agent: "agent-1".into(),
                supervisor: None,
                slot: key("2026-09-01", "10:00"),
                notes: None,
            })
            .await
            .unwrap();

        maybe_compact(&engine, 3).await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // State survives the rewrite
        let teachers = engine.list_teachers().await;
        assert_eq!(teachers.len(), 1);
        assert_eq!(teachers[0].name, "Mr Reyes");
    }
}
