use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tokio::task;
use tracing::{Instrument, error, info, info_span, warn};

use crate::artifact::{
    ArtifactSource, ArtifactStore, ArtifactTranscription, TranscriptArtifact, full_text, word_count,
};
use crate::downloader::Downloader;
use crate::events::EventHub;
use crate::source::{MediaSource, ParsedSource, parse_source_url};
use crate::store::{
    InsertOutcome, JobStatus, MediaMetadata, Store, TranscriptionRecord, TranscriptionResult,
    normalize_tags,
};
use crate::transcriber::TranscriberClient;

const PROGRESS_DOWNLOADING: i64 = 10;
const PROGRESS_TRANSCRIBING: i64 = 50;
const PROGRESS_SAVING: i64 = 90;
const PROGRESS_COMPLETED: i64 = 100;

const SHOW_NOTES_ATTEMPTS: usize = 3;
const SHOW_NOTES_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of accepting a submission.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// A pending record was created and a background run started.
    Accepted(TranscriptionRecord),
    /// The source URL already has a record; no new run starts.
    Duplicate(String),
}

/// Owns the per-submission pipeline end to end.
///
/// Each accepted submission runs pending → downloading → transcribing →
/// completed on a background task; any stage failure lands the record in
/// `failed` with its error text and never escapes the task.
pub struct Orchestrator {
    store: Arc<Store>,
    artifacts: Arc<ArtifactStore>,
    downloader: Arc<Downloader>,
    transcriber: TranscriberClient,
    events: Arc<EventHub>,
    audio_cache_days: i64,
    http: reqwest::Client,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        artifacts: Arc<ArtifactStore>,
        downloader: Arc<Downloader>,
        transcriber: TranscriberClient,
        events: Arc<EventHub>,
        audio_cache_days: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            artifacts,
            downloader,
            transcriber,
            events,
            audio_cache_days,
            http: reqwest::Client::new(),
        })
    }

    pub fn events(&self) -> Arc<EventHub> {
        Arc::clone(&self.events)
    }

    /// Accept a submission: parse, dedupe, create the pending record, and
    /// kick off the background run. Returns immediately.
    pub async fn submit(
        self: &Arc<Self>,
        url: &str,
        tags: &[String],
        source_context: Option<String>,
    ) -> Result<SubmitOutcome> {
        let parsed = parse_source_url(url)?;
        let tags = normalize_tags(tags)?;
        let id = parsed.canonical_id();

        let store = Arc::clone(&self.store);
        let outcome = {
            let id = id.clone();
            let source_type = parsed.source.source_type().to_string();
            let source_url = parsed.source_url.clone();
            let tags = tags.clone();
            let source_context = source_context.clone();
            task::spawn_blocking(move || {
                store.insert_pending(
                    &id,
                    &source_type,
                    &source_url,
                    &tags,
                    source_context.as_deref(),
                )
            })
            .await
            .map_err(|err| anyhow!(err).context("store task panicked"))??
        };

        match outcome {
            InsertOutcome::Duplicate(existing) => {
                info!(id = %existing, url, "duplicate submission");
                Ok(SubmitOutcome::Duplicate(existing))
            }
            InsertOutcome::Created(record) => {
                info!(id = %record.id, source = %parsed.source, "accepted submission");
                self.events
                    .publish_status(&record.id, JobStatus::Pending, 0, None);
                let orchestrator = Arc::clone(self);
                let run_record = record.clone();
                tokio::spawn(async move {
                    orchestrator.run(parsed, run_record).await;
                });
                Ok(SubmitOutcome::Accepted(record))
            }
        }
    }

    async fn run(self: Arc<Self>, parsed: ParsedSource, record: TranscriptionRecord) {
        let id = record.id.clone();
        let span = info_span!("transcription.run", id = %id);
        if let Err(err) = self.drive(parsed, record).instrument(span).await {
            let message = format!("{err:#}");
            error!(id = %id, error = %message, "transcription run failed");
            self.fail(&id, &message).await;
        }
    }

    async fn drive(&self, parsed: ParsedSource, record: TranscriptionRecord) -> Result<()> {
        let id = record.id.clone();

        self.transition(&id, JobStatus::Downloading, PROGRESS_DOWNLOADING)
            .await?;

        // Creator notes are best-effort and never block the pipeline.
        if record.source_context.is_none() {
            if let MediaSource::ApplePodcasts { .. } = parsed.source {
                if let Some(notes) = self.fetch_show_notes(&parsed.source_url).await {
                    self.store_source_context(&id, notes).await;
                }
            }
        }

        let outcome = self
            .downloader
            .fetch(&parsed.source, &parsed.source_url, &id)
            .await
            .context("audio download failed")?;

        let cached_until = Utc::now() + chrono::Duration::days(self.audio_cache_days);
        let metadata = MediaMetadata {
            title: outcome.title.clone(),
            channel: outcome.channel.clone(),
            thumbnail_url: outcome.thumbnail_url.clone(),
            upload_date: outcome.upload_date.clone(),
            duration_seconds: outcome.duration_seconds,
            audio_path: Some(outcome.audio_path.to_string_lossy().into_owned()),
            audio_format: Some(outcome.audio_format.clone()),
        };
        {
            let store = Arc::clone(&self.store);
            let id = id.clone();
            let metadata = metadata.clone();
            task::spawn_blocking(move || {
                store.set_media_metadata(&id, &metadata, Some(cached_until))
            })
            .await
            .map_err(|err| anyhow!(err).context("store task panicked"))??;
        }
        if record.source_context.is_none() {
            if let Some(description) = outcome
                .description
                .clone()
                .filter(|text| !text.trim().is_empty())
            {
                self.store_source_context(&id, description).await;
            }
        }

        self.transition(&id, JobStatus::Transcribing, PROGRESS_TRANSCRIBING)
            .await?;

        let output = self
            .transcriber
            .transcribe(&outcome.audio_path)
            .await
            .context("transcription failed")?;

        let text = full_text(&output.segments);
        let model_used = output.model.clone().unwrap_or_else(|| "unknown".into());
        let artifact = TranscriptArtifact {
            id: id.clone(),
            source: ArtifactSource {
                source_type: parsed.source.source_type().into(),
                url: parsed.source_url.clone(),
                title: outcome.title.clone(),
                channel: outcome.channel.clone(),
                thumbnail_url: outcome.thumbnail_url.clone(),
                upload_date: outcome.upload_date.clone(),
                duration_seconds: outcome.duration_seconds,
            },
            transcription: ArtifactTranscription {
                language: output.language.clone(),
                model: model_used.clone(),
                duration_seconds: output.duration_seconds.or(outcome.duration_seconds),
                segments: output.segments.clone(),
            },
            word_count: word_count(&text),
            segments_count: output.segments.len(),
            full_text: text.clone(),
            created_at: Utc::now(),
        };

        let artifact_path = {
            let artifacts = Arc::clone(&self.artifacts);
            let artifact = artifact.clone();
            task::spawn_blocking(move || artifacts.save(&artifact))
                .await
                .map_err(|err| anyhow!(err).context("artifact task panicked"))??
        };

        self.transition(&id, JobStatus::Transcribing, PROGRESS_SAVING)
            .await?;

        let result = TranscriptionResult {
            language: output.language,
            model_used,
            word_count: artifact.word_count as i64,
            segments_count: artifact.segments_count as i64,
            full_text: text,
            transcription_path: artifact_path.to_string_lossy().into_owned(),
        };
        {
            let store = Arc::clone(&self.store);
            let id = id.clone();
            task::spawn_blocking(move || store.set_transcription_result(&id, &result))
                .await
                .map_err(|err| anyhow!(err).context("store task panicked"))??;
        }

        let completed = self
            .transition(&id, JobStatus::Completed, PROGRESS_COMPLETED)
            .await?;
        if let Some(record) = completed {
            self.events.publish_completed(&record);
        }
        info!(id = %id, "transcription completed");
        Ok(())
    }

    async fn transition(
        &self,
        id: &str,
        status: JobStatus,
        progress: i64,
    ) -> Result<Option<TranscriptionRecord>> {
        let store = Arc::clone(&self.store);
        let record = {
            let id = id.to_string();
            task::spawn_blocking(move || store.update_status(&id, status, progress, None))
                .await
                .map_err(|err| anyhow!(err).context("store task panicked"))??
        };
        if let Some(record) = &record {
            self.events
                .publish_status(id, record.status, record.progress, None);
        }
        Ok(record)
    }

    async fn fail(&self, id: &str, message: &str) {
        let store = Arc::clone(&self.store);
        let update = {
            let id = id.to_string();
            let message = message.to_string();
            task::spawn_blocking(move || {
                store.update_status(&id, JobStatus::Failed, 0, Some(&message))
            })
            .await
        };
        match update {
            Ok(Ok(Some(record))) => {
                self.events.publish_status(
                    id,
                    JobStatus::Failed,
                    record.progress,
                    record.error_message.as_deref(),
                );
                self.events.publish_error(id, message);
            }
            Ok(Ok(None)) => warn!(id, "failed run for a record that no longer exists"),
            Ok(Err(err)) => error!(id, error = %err, "could not persist failure"),
            Err(err) => error!(id, error = %err, "store task panicked during failure"),
        }
    }

    async fn store_source_context(&self, id: &str, notes: String) {
        let store = Arc::clone(&self.store);
        let id_owned = id.to_string();
        let stored =
            task::spawn_blocking(move || store.set_source_context(&id_owned, &notes)).await;
        if let Ok(Err(err)) = stored {
            warn!(id, error = %err, "failed to persist creator notes");
        }
    }

    /// Fetch Apple Podcasts show notes for a submission. Up to three
    /// attempts on 5xx/timeout; any other failure gives up silently.
    async fn fetch_show_notes(&self, url: &str) -> Option<String> {
        for attempt in 1..=SHOW_NOTES_ATTEMPTS {
            let response = self
                .http
                .get(url)
                .timeout(SHOW_NOTES_TIMEOUT)
                .send()
                .await;
            match response {
                Ok(response) if response.status().is_success() => {
                    let body = response.text().await.ok()?;
                    return extract_page_description(&body);
                }
                Ok(response) if response.status().is_server_error() => {
                    warn!(url, attempt, status = %response.status(), "show notes fetch rejected");
                }
                Ok(response) => {
                    warn!(url, status = %response.status(), "show notes unavailable");
                    return None;
                }
                Err(err) if err.is_timeout() => {
                    warn!(url, attempt, "show notes fetch timed out");
                }
                Err(err) => {
                    warn!(url, error = %err, "show notes fetch failed");
                    return None;
                }
            }
            if attempt < SHOW_NOTES_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
        None
    }
}

/// Pull the episode description out of a podcast landing page.
fn extract_page_description(html: &str) -> Option<String> {
    static META_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let meta = META_RE.get_or_init(|| {
        regex::Regex::new(
            r#"<meta[^>]+(?:property="og:description"|name="description")[^>]+content="([^"]*)""#,
        )
        .unwrap()
    });
    let raw = meta.captures(html)?.get(1)?.as_str();
    let decoded = decode_entities(raw);
    let trimmed = decoded.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn decode_entities(raw: &str) -> String {
    raw.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_description_prefers_og_tag() {
        let html = r#"<html><head>
            <meta property="og:description" content="Notes about &quot;bread&quot; &amp; butter">
            </head></html>"#;
        assert_eq!(
            extract_page_description(html).unwrap(),
            "Notes about \"bread\" & butter"
        );
    }

    #[test]
    fn page_without_description_yields_none() {
        assert!(extract_page_description("<html><head></head></html>").is_none());
        let empty = r#"<meta name="description" content="">"#;
        assert!(extract_page_description(empty).is_none());
    }

    #[test]
    fn progress_bands_are_ordered() {
        assert!(PROGRESS_DOWNLOADING < PROGRESS_TRANSCRIBING);
        assert!(PROGRESS_TRANSCRIBING < PROGRESS_SAVING);
        assert!(PROGRESS_SAVING < PROGRESS_COMPLETED);
    }
}
