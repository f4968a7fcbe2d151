use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tokio::task;
use tracing::{debug, info, warn};

use crate::artifact::ArtifactStore;
use crate::config::CleanupSettings;
use crate::store::Store;

/// Outcome of one maintenance sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_audio: usize,
    pub removed_failed: usize,
}

/// Periodic maintenance: drop expired cached audio and age out failed
/// records. Runs until the surrounding task is stopped.
pub async fn run_loop(store: Arc<Store>, artifacts: Arc<ArtifactStore>, settings: CleanupSettings) {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(settings.interval_hours.max(1) * 3600));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match sweep(&store, &artifacts, settings.failed_retention_days).await {
            Ok(report) => {
                if report.expired_audio > 0 || report.removed_failed > 0 {
                    info!(
                        expired_audio = report.expired_audio,
                        removed_failed = report.removed_failed,
                        "cleanup sweep finished"
                    );
                } else {
                    debug!("cleanup sweep found nothing to do");
                }
            }
            Err(err) => warn!(error = %err, "cleanup sweep failed"),
        }
    }
}

/// One sweep: expire cached audio past its deadline, then delete failed
/// records older than the retention window along with their disk state.
pub async fn sweep(
    store: &Arc<Store>,
    artifacts: &Arc<ArtifactStore>,
    failed_retention_days: i64,
) -> Result<SweepReport> {
    let now = Utc::now();
    let mut report = SweepReport::default();

    let expired = {
        let store = Arc::clone(store);
        task::spawn_blocking(move || store.take_expired_audio(now))
            .await
            .map_err(|err| anyhow!(err).context("cleanup task panicked"))??
    };
    for (id, path) in expired {
        remove_file_if_present(Path::new(&path));
        debug!(id = %id, path = %path, "expired cached audio");
        report.expired_audio += 1;
    }

    let cutoff = now - chrono::Duration::days(failed_retention_days);
    let removed = {
        let store = Arc::clone(store);
        task::spawn_blocking(move || store.delete_failed_before(cutoff))
            .await
            .map_err(|err| anyhow!(err).context("cleanup task panicked"))??
    };
    for record in removed {
        if let Some(path) = &record.audio_path {
            remove_file_if_present(Path::new(path));
        }
        let artifacts = Arc::clone(artifacts);
        let id = record.id.clone();
        let deleted = task::spawn_blocking(move || artifacts.delete(&id)).await;
        if let Ok(Err(err)) = deleted {
            warn!(id = %record.id, error = %err, "failed to delete artifact during cleanup");
        }
        report.removed_failed += 1;
    }

    Ok(report)
}

/// Missing files are expected after manual cleanup and are not an error.
fn remove_file_if_present(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InsertOutcome, JobStatus, MediaMetadata};
    use tempfile::tempdir;

    fn seeded_store() -> Arc<Store> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        match store
            .insert_pending(
                "youtube_abc12345678",
                "youtube",
                "https://youtu.be/abc12345678",
                &[],
                None,
            )
            .unwrap()
        {
            InsertOutcome::Created(_) => {}
            InsertOutcome::Duplicate(_) => panic!("fresh store had a duplicate"),
        }
        store
    }

    #[tokio::test]
    async fn sweep_unlinks_expired_audio_and_clears_path() {
        let dir = tempdir().unwrap();
        let audio = dir.path().join("youtube_abc12345678.mp3");
        std::fs::write(&audio, b"audio").unwrap();

        let store = seeded_store();
        store
            .set_media_metadata(
                "youtube_abc12345678",
                &MediaMetadata {
                    audio_path: Some(audio.to_string_lossy().into_owned()),
                    audio_format: Some("mp3".into()),
                    ..Default::default()
                },
                Some(Utc::now() - chrono::Duration::days(2)),
            )
            .unwrap();
        let artifacts = Arc::new(ArtifactStore::new(dir.path().join("artifacts")).unwrap());

        let report = sweep(&store, &artifacts, 7).await.unwrap();
        assert_eq!(report.expired_audio, 1);
        assert!(!audio.exists());
        assert!(
            store
                .get("youtube_abc12345678")
                .unwrap()
                .unwrap()
                .audio_path
                .is_none()
        );
    }

    #[tokio::test]
    async fn sweep_tolerates_already_missing_audio() {
        let dir = tempdir().unwrap();
        let store = seeded_store();
        store
            .set_media_metadata(
                "youtube_abc12345678",
                &MediaMetadata {
                    audio_path: Some(
                        dir.path().join("gone.mp3").to_string_lossy().into_owned(),
                    ),
                    ..Default::default()
                },
                Some(Utc::now() - chrono::Duration::days(2)),
            )
            .unwrap();
        let artifacts = Arc::new(ArtifactStore::new(dir.path().join("artifacts")).unwrap());

        let report = sweep(&store, &artifacts, 7).await.unwrap();
        assert_eq!(report.expired_audio, 1);
    }

    #[tokio::test]
    async fn sweep_keeps_recent_failed_records() {
        let dir = tempdir().unwrap();
        let store = seeded_store();
        store
            .update_status("youtube_abc12345678", JobStatus::Failed, 10, Some("boom"))
            .unwrap();
        let artifacts = Arc::new(ArtifactStore::new(dir.path().join("artifacts")).unwrap());

        let report = sweep(&store, &artifacts, 7).await.unwrap();
        assert_eq!(report.removed_failed, 0);
        assert!(store.get("youtube_abc12345678").unwrap().is_some());
    }
}
