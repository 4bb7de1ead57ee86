use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the journal once enough events have
/// piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// One compactor pass. Returns true if the journal was rewritten.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appended = engine.journal_appends_since_compact().await;
    if appended < threshold {
        return false;
    }
    match engine.compact_journal().await {
        Ok(()) => {
            info!("journal compacted after {appended} appends");
            true
        }
        Err(e) => {
            error!("journal compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;

    fn test_journal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tutorbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_journal_path("threshold.journal");
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let admin = engine
            .bootstrap_admin(AccountDraft {
                first_name: "Ada".into(),
                last_name: "Admin".into(),
                email: "ada@example.edu".into(),
                nuid: "00000001".into(),
                profile: Profile::Admin,
            })
            .await
            .unwrap();
        let admin = Principal::admin(admin.id);
        for i in 0..4 {
            engine
                .add_location(&admin, format!("Room {i}"), Modality::InPerson, None)
                .await
                .unwrap();
        }

        assert!(!compact_if_due(&engine, 10).await);
        assert_eq!(engine.journal_appends_since_compact().await, 5);
        assert!(compact_if_due(&engine, 5).await);
        assert_eq!(engine.journal_appends_since_compact().await, 0);

        drop(engine);
        let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
        assert_eq!(engine.account(&admin.account).unwrap().role(), Role::Admin);
    }
}
