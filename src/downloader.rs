use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::source::{MediaSource, direct_audio_extension};

/// Longest description carried forward as media metadata.
const DESCRIPTION_LIMIT: usize = 2000;

/// A deposited audio file plus the metadata extracted alongside it.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub audio_path: PathBuf,
    pub audio_format: String,
    pub title: Option<String>,
    pub channel: Option<String>,
    pub thumbnail_url: Option<String>,
    pub upload_date: Option<String>,
    pub duration_seconds: Option<f64>,
    pub description: Option<String>,
}

/// Fetches submission audio into the cache directory.
///
/// Platform sources go through yt-dlp; direct audio is streamed with
/// reqwest. Every failure is recoverable from the orchestrator's point of
/// view: the error carries a human-readable message and nothing panics.
pub struct Downloader {
    cache_dir: PathBuf,
    max_bytes: u64,
    timeout: Duration,
    yt_dlp_override: Option<PathBuf>,
    http: reqwest::Client,
}

impl Downloader {
    pub fn new(
        cache_dir: PathBuf,
        max_bytes: u64,
        timeout: Duration,
        yt_dlp_override: Option<PathBuf>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir).with_context(|| {
            format!("failed to create audio cache directory {}", cache_dir.display())
        })?;
        Ok(Self {
            cache_dir,
            max_bytes,
            timeout,
            yt_dlp_override,
            http: reqwest::Client::new(),
        })
    }

    /// Deposit one audio file for the submission and return its path and
    /// metadata. The whole operation runs under the configured wall-clock
    /// timeout.
    pub async fn fetch(
        &self,
        source: &MediaSource,
        url: &str,
        id: &str,
    ) -> Result<DownloadOutcome> {
        let work = async {
            match source {
                MediaSource::DirectAudio { .. } => self.fetch_direct(url, id).await,
                _ => self.fetch_with_yt_dlp(url, id).await,
            }
        };
        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result,
            Err(_) => bail!(
                "download timed out after {}s for {url}",
                self.timeout.as_secs()
            ),
        }
    }

    fn yt_dlp_binary(&self) -> Result<PathBuf> {
        if let Some(path) = &self.yt_dlp_override {
            return Ok(path.clone());
        }
        which::which("yt-dlp").context("yt-dlp not found on PATH; install it or set SCRIBE_YT_DLP_PATH")
    }

    async fn fetch_with_yt_dlp(&self, url: &str, id: &str) -> Result<DownloadOutcome> {
        let binary = self.yt_dlp_binary()?;
        let info = self.probe_metadata(&binary, url).await?;

        // A known-oversized file is rejected before any bytes move.
        if let Some(size) = info
            .get("filesize")
            .and_then(Value::as_u64)
            .or_else(|| info.get("filesize_approx").and_then(Value::as_u64))
        {
            if size > self.max_bytes {
                bail!(
                    "audio size {size} bytes exceeds the {} byte limit",
                    self.max_bytes
                );
            }
        }

        let output_template = self.cache_dir.join(format!("{id}.%(ext)s"));
        let output = Command::new(&binary)
            .args([
                "--output",
                &output_template.to_string_lossy(),
                "--extract-audio",
                "--audio-format",
                "mp3",
                "--format",
                "bestaudio/best",
                "--no-playlist",
                "--no-progress",
                url,
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("failed to run {}", binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("yt-dlp failed for {url}: {}", stderr.trim());
        }

        let audio_path = self.cache_dir.join(format!("{id}.mp3"));
        let size = tokio::fs::metadata(&audio_path)
            .await
            .with_context(|| {
                format!("yt-dlp reported success but {} is missing", audio_path.display())
            })?
            .len();
        if size > self.max_bytes {
            let _ = tokio::fs::remove_file(&audio_path).await;
            bail!(
                "downloaded audio {size} bytes exceeds the {} byte limit",
                self.max_bytes
            );
        }

        Ok(DownloadOutcome {
            audio_path,
            audio_format: "mp3".into(),
            title: info.get("title").and_then(Value::as_str).map(str::to_string),
            channel: info
                .get("channel")
                .and_then(Value::as_str)
                .or_else(|| info.get("uploader").and_then(Value::as_str))
                .map(str::to_string),
            thumbnail_url: info
                .get("thumbnail")
                .and_then(Value::as_str)
                .map(str::to_string),
            upload_date: info
                .get("upload_date")
                .and_then(Value::as_str)
                .map(str::to_string),
            duration_seconds: info.get("duration").and_then(Value::as_f64),
            description: info
                .get("description")
                .and_then(Value::as_str)
                .map(truncate_description),
        })
    }

    async fn probe_metadata(&self, binary: &Path, url: &str) -> Result<Value> {
        debug!(url, "probing media metadata");
        let output = Command::new(binary)
            .args(["--dump-json", "--no-playlist", url])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("failed to run {}", binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("yt-dlp metadata probe failed for {url}: {}", stderr.trim());
        }

        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("yt-dlp emitted malformed metadata JSON for {url}"))
    }

    async fn fetch_direct(&self, url: &str, id: &str) -> Result<DownloadOutcome> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to fetch direct audio {url}"))?;
        if !response.status().is_success() {
            bail!("direct audio fetch for {url} returned {}", response.status());
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                bail!(
                    "audio size {length} bytes exceeds the {} byte limit",
                    self.max_bytes
                );
            }
        }

        let extension = direct_audio_extension(url)
            .map(str::to_string)
            .or_else(|| extension_from_content_type(&response))
            .unwrap_or_else(|| "mp3".into());
        let final_path = self.cache_dir.join(format!("{id}.{extension}"));
        let tmp_path = self.cache_dir.join(format!(".{id}.{extension}.part"));

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("network error streaming {url}"))?;
            written += chunk.len() as u64;
            if written > self.max_bytes {
                drop(file);
                let _ = tokio::fs::remove_file(&tmp_path).await;
                bail!(
                    "audio stream exceeded the {} byte limit at {written} bytes",
                    self.max_bytes
                );
            }
            file.write_all(&chunk)
                .await
                .with_context(|| format!("failed writing {}", tmp_path.display()))?;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .with_context(|| format!("failed to commit {}", final_path.display()))?;

        let title = url
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .map(|segment| segment.split('?').next().unwrap_or(segment).to_string());

        Ok(DownloadOutcome {
            audio_path: final_path,
            audio_format: extension,
            title,
            channel: None,
            thumbnail_url: None,
            upload_date: None,
            duration_seconds: None,
            description: None,
        })
    }

    /// Warn once at startup when yt-dlp is unavailable; platform downloads
    /// will fail until it is installed.
    pub fn check_yt_dlp(&self) {
        if let Err(err) = self.yt_dlp_binary() {
            warn!(error = %err, "yt-dlp unavailable; platform sources cannot be downloaded");
        }
    }
}

fn truncate_description(raw: &str) -> String {
    if raw.len() <= DESCRIPTION_LIMIT {
        return raw.to_string();
    }
    let mut cut = DESCRIPTION_LIMIT;
    while !raw.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &raw[..cut])
}

fn extension_from_content_type(response: &reqwest::Response) -> Option<String> {
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)?
        .to_str()
        .ok()?;
    let ext = match content_type.split(';').next()?.trim() {
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "m4a",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/ogg" => "ogg",
        "audio/flac" | "audio/x-flac" => "flac",
        "audio/aac" => "aac",
        _ => return None,
    };
    Some(ext.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_truncation_respects_char_boundaries() {
        let short = truncate_description("hello");
        assert_eq!(short, "hello");

        let long = "é".repeat(DESCRIPTION_LIMIT);
        let truncated = truncate_description(&long);
        assert!(truncated.ends_with('…'));
        assert!(truncated.chars().count() <= DESCRIPTION_LIMIT + 1);
    }

    #[tokio::test]
    async fn failed_direct_fetch_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(
            dir.path().to_path_buf(),
            4,
            Duration::from_secs(5),
            None,
        )
        .unwrap();

        // Unroutable port: the fetch fails before anything is written.
        let result = downloader
            .fetch(
                &MediaSource::DirectAudio { digest: "abcdef012345".into() },
                "http://127.0.0.1:1/audio.mp3",
                "direct_audio_abcdef012345",
            )
            .await;
        assert!(result.is_err());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
