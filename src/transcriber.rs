use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::artifact::Segment;

/// Terminal output of a successful ASR job.
#[derive(Debug, Clone)]
pub struct TranscriptionOutput {
    pub language: String,
    pub model: Option<String>,
    pub duration_seconds: Option<f64>,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    status: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    segments: Option<Vec<Segment>>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for the external ASR service.
///
/// The service owns its retry semantics; this client submits once and
/// polls until the job reaches a terminal state or the wait budget runs
/// out.
#[derive(Debug, Clone)]
pub struct TranscriberClient {
    base_url: String,
    poll_interval: Duration,
    wait_timeout: Duration,
    http: reqwest::Client,
}

impl TranscriberClient {
    pub fn new(base_url: &str, poll_interval: Duration, wait_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval,
            wait_timeout,
            http: reqwest::Client::new(),
        }
    }

    /// Probe the service at startup. Unreachable is a warning, not a
    /// blocker; jobs submitted later will fail on their own.
    pub async fn probe_health(&self) {
        let url = format!("{}/health", self.base_url);
        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url, "transcriber reachable");
            }
            Ok(response) => {
                warn!(url, status = %response.status(), "transcriber health probe rejected");
            }
            Err(err) => {
                warn!(url, error = %err, "transcriber unreachable at startup");
            }
        }
    }

    /// Upload an audio file and return the remote job id.
    pub async fn submit(&self, audio_path: &Path) -> Result<String> {
        let file = tokio::fs::File::open(audio_path)
            .await
            .with_context(|| format!("failed to open audio file {}", audio_path.display()))?;
        let file_name = audio_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".into());
        let part = Part::stream(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .file_name(file_name);
        let form = Form::new().part("file", part);

        let url = format!("{}/transcribe", self.base_url);
        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("failed to submit audio to {url}"))?;
        if !response.status().is_success() {
            bail!("transcriber rejected submission with {}", response.status());
        }
        let submitted: SubmitResponse = response
            .json()
            .await
            .context("malformed response from transcriber submission")?;
        Ok(submitted.job_id)
    }

    /// Poll the job until it completes, fails, or the wait budget elapses.
    pub async fn wait_for_completion(&self, job_id: &str) -> Result<TranscriptionOutput> {
        let url = format!("{}/jobs/{}", self.base_url, job_id);
        let poll = async {
            loop {
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .with_context(|| format!("failed to poll transcriber job {job_id}"))?;
                if !response.status().is_success() {
                    bail!("transcriber job poll returned {}", response.status());
                }
                let job: JobResponse = response
                    .json()
                    .await
                    .context("malformed response from transcriber job poll")?;

                match job.status.as_str() {
                    "completed" => {
                        let language = job
                            .language
                            .context("completed transcription is missing its language")?;
                        let segments = job
                            .segments
                            .context("completed transcription is missing its segments")?;
                        return Ok(TranscriptionOutput {
                            language,
                            model: job.model,
                            duration_seconds: job.duration,
                            segments,
                        });
                    }
                    "failed" => {
                        let reason = job.error.unwrap_or_else(|| "unspecified failure".into());
                        bail!("transcription failed: {reason}");
                    }
                    other => {
                        debug!(job_id, status = other, "transcription in progress");
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
            }
        };

        match tokio::time::timeout(self.wait_timeout, poll).await {
            Ok(result) => result,
            Err(_) => bail!(
                "transcription did not finish within {}s",
                self.wait_timeout.as_secs()
            ),
        }
    }

    /// Submit and wait in one step.
    pub async fn transcribe(&self, audio_path: &Path) -> Result<TranscriptionOutput> {
        let job_id = self.submit(audio_path).await?;
        debug!(job_id, audio = %audio_path.display(), "submitted transcription job");
        self.wait_for_completion(&job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_response_parses_completed_payload() {
        let raw = r#"{
            "status": "completed",
            "language": "en",
            "model": "whisper-large-v3",
            "duration": 12.5,
            "segments": [
                {"id": 0, "start": 0.0, "end": 2.0, "text": "Hello there."}
            ]
        }"#;
        let job: JobResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(job.status, "completed");
        assert_eq!(job.language.as_deref(), Some("en"));
        assert_eq!(job.segments.unwrap().len(), 1);
    }

    #[test]
    fn job_response_tolerates_sparse_progress_payload() {
        let job: JobResponse = serde_json::from_str(r#"{"status": "processing"}"#).unwrap();
        assert_eq!(job.status, "processing");
        assert!(job.language.is_none());
        assert!(job.segments.is_none());
    }

    #[tokio::test]
    async fn unreachable_transcriber_is_a_recoverable_error() {
        let client = TranscriberClient::new(
            "http://127.0.0.1:1",
            Duration::from_millis(10),
            Duration::from_millis(200),
        );
        let err = client.wait_for_completion("job-1").await.unwrap_err();
        assert!(err.to_string().contains("job-1"));
    }
}
