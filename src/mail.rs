pub mod format;
pub mod worker;

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use mail_parser::MessageParser;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::source::{MediaSource, direct_audio_extension, parse_source_url};
use crate::summarizer::HTML_FORMAT_SUFFIX;

/// Poll interval while waiting for a submitted job to finish.
const COMPLETION_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Budget for one job: download timeout plus the ASR wait, with headroom.
const COMPLETION_WAIT_TIMEOUT: Duration = Duration::from_secs(2 * 3600);

/// An email reduced to the parts the worker routes on.
#[derive(Debug, Clone, Default)]
pub struct ParsedEmail {
    pub subject: String,
    pub from_addr: Option<String>,
    pub text: Option<String>,
    pub html: Option<String>,
}

impl ParsedEmail {
    /// Plain-text body, degrading the HTML part when no text part exists.
    pub fn plain_body(&self) -> String {
        if let Some(text) = &self.text {
            if !text.trim().is_empty() {
                return text.clone();
            }
        }
        self.html
            .as_deref()
            .and_then(|html| html2text::from_read(html.as_bytes(), 80).ok())
            .unwrap_or_default()
    }
}

/// Decode a raw RFC822 message into the routing fields.
pub fn parse_email(raw: &[u8]) -> ParsedEmail {
    let Some(message) = MessageParser::default().parse(raw) else {
        warn!("unparseable email payload");
        return ParsedEmail::default();
    };
    ParsedEmail {
        subject: message.subject().unwrap_or_default().to_string(),
        from_addr: message
            .from()
            .and_then(|from| from.first())
            .and_then(|sender| sender.address())
            .map(|addr| addr.to_string()),
        text: message.body_text(0).map(|body| body.into_owned()),
        html: message.body_html(0).map(|body| body.into_owned()),
    }
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>"'\)\]]+"#).unwrap())
}

fn href_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"<a[^>]+href\s*=\s*["']([^"']+)["']"#).unwrap())
}

/// Collect candidate URLs from the plain and HTML bodies, deduplicated in
/// first-seen order. HTML contributes both anchor targets and any URLs in
/// its visible text.
pub fn extract_urls(email: &ParsedEmail) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    let mut push = |raw: &str| {
        let url = trim_url(raw);
        if !url.is_empty() && !seen.iter().any(|existing| existing == &url) {
            seen.push(url);
        }
    };

    if let Some(text) = &email.text {
        for hit in url_re().find_iter(text) {
            push(hit.as_str());
        }
    }
    if let Some(html) = &email.html {
        for captures in href_re().captures_iter(html) {
            push(&captures[1]);
        }
        for hit in url_re().find_iter(html) {
            push(hit.as_str());
        }
    }
    seen
}

fn trim_url(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(['.', ',', ';', '!', '?', ')', ']', '>'])
        .to_string()
}

/// Whether the generic pipeline accepts this URL: any platform source, or a
/// direct link with a supported audio extension.
pub fn is_transcribable(url: &str) -> bool {
    match parse_source_url(url) {
        Ok(parsed) => match parsed.source {
            MediaSource::DirectAudio { .. } => direct_audio_extension(url).is_some(),
            _ => true,
        },
        Err(_) => false,
    }
}

/// Whether the episode-sources pipeline accepts this URL: Apple Podcasts or
/// YouTube only.
pub fn is_episode_source_url(url: &str) -> bool {
    match parse_source_url(url) {
        Ok(parsed) => matches!(
            parsed.source,
            MediaSource::YouTube { .. } | MediaSource::ApplePodcasts { .. }
        ),
        Err(_) => false,
    }
}

/// Pick the routing tag from a subject line: the first whitespace-separated
/// word (lowercased) that names an existing tag wins, otherwise the
/// configured default.
pub fn tag_from_subject(subject: &str, known_tags: &[String], default_tag: &str) -> String {
    subject
        .split_whitespace()
        .map(|word| word.to_lowercase())
        .find(|word| known_tags.iter().any(|tag| tag == word))
        .unwrap_or_else(|| default_tag.to_string())
}

/// Transcription record as served by the frontend API.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTranscription {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub progress: i64,
    pub source_url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub transcribed_at: Option<String>,
    #[serde(default)]
    pub full_text: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub source_context: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSummary {
    pub summary_text: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoteTagDetail {
    #[serde(default)]
    destination_emails: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct TagsResponse {
    tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ConflictResponse {
    existing_id: String,
}

/// Result of submitting a URL to the frontend.
#[derive(Debug)]
pub enum RemoteSubmitOutcome {
    Accepted(String),
    AlreadyKnown(String),
}

/// HTTP client for the scribe frontend API.
#[derive(Debug, Clone)]
pub struct FrontendClient {
    base_url: String,
    http: reqwest::Client,
}

impl FrontendClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Submit a URL; a 409 is the already-transcribed signal, not an error.
    pub async fn submit(&self, url: &str, tag: &str) -> Result<RemoteSubmitOutcome> {
        let response = self
            .http
            .post(self.url("/api/transcribe"))
            .json(&json!({ "url": url, "tags": [tag] }))
            .send()
            .await
            .context("frontend submission request failed")?;

        match response.status().as_u16() {
            202 => {
                let record: RemoteTranscription = response
                    .json()
                    .await
                    .context("malformed submission response")?;
                Ok(RemoteSubmitOutcome::Accepted(record.id))
            }
            409 => {
                let conflict: ConflictResponse = response
                    .json()
                    .await
                    .context("malformed conflict response")?;
                Ok(RemoteSubmitOutcome::AlreadyKnown(conflict.existing_id))
            }
            status => {
                let detail = response.text().await.unwrap_or_default();
                bail!("frontend rejected submission ({status}): {}", detail.trim())
            }
        }
    }

    pub async fn get_transcription(&self, id: &str) -> Result<RemoteTranscription> {
        let response = self
            .http
            .get(self.url(&format!("/api/transcriptions/{id}")))
            .send()
            .await
            .context("frontend transcription fetch failed")?;
        if !response.status().is_success() {
            bail!("transcription fetch for {id} returned {}", response.status());
        }
        response
            .json()
            .await
            .context("malformed transcription response")
    }

    /// Poll the status API until the record reaches a terminal state.
    pub async fn wait_for_completion(&self, id: &str) -> Result<RemoteTranscription> {
        let poll = async {
            loop {
                let record = self.get_transcription(id).await?;
                match record.status.as_str() {
                    "completed" | "failed" => return Ok(record),
                    other => {
                        debug!(id, status = other, progress = record.progress, "job in flight");
                        tokio::time::sleep(COMPLETION_POLL_INTERVAL).await;
                    }
                }
            }
        };
        match tokio::time::timeout(COMPLETION_WAIT_TIMEOUT, poll).await {
            Ok(result) => result,
            Err(_) => bail!(
                "transcription {id} did not finish within {}s",
                COMPLETION_WAIT_TIMEOUT.as_secs()
            ),
        }
    }

    /// Tags currently known to the frontend.
    pub async fn tags(&self) -> Result<Vec<String>> {
        let response = self
            .http
            .get(self.url("/api/tags"))
            .send()
            .await
            .context("frontend tag fetch failed")?;
        if !response.status().is_success() {
            bail!("tag fetch returned {}", response.status());
        }
        let parsed: TagsResponse = response.json().await.context("malformed tags response")?;
        Ok(parsed.tags)
    }

    /// Destination addresses configured for a tag, when any.
    pub async fn tag_destinations(&self, tag: &str) -> Result<Option<Vec<String>>> {
        let response = self
            .http
            .get(self.url(&format!("/api/tags/{tag}")))
            .send()
            .await
            .context("frontend tag config fetch failed")?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            bail!("tag config fetch returned {}", response.status());
        }
        let detail: RemoteTagDetail = response
            .json()
            .await
            .context("malformed tag config response")?;
        Ok(detail
            .destination_emails
            .filter(|addresses| !addresses.is_empty()))
    }

    /// Request an HTML-formatted summary for a completed transcription.
    pub async fn request_html_summary(&self, transcription_id: &str) -> Result<String> {
        let response = self
            .http
            .post(self.url("/api/summaries"))
            .json(&json!({
                "transcription_id": transcription_id,
                "system_prompt_suffix": HTML_FORMAT_SUFFIX,
            }))
            .send()
            .await
            .context("frontend summary request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            bail!("summary request returned {status}: {}", detail.trim());
        }
        let summary: RemoteSummary = response
            .json()
            .await
            .context("malformed summary response")?;
        Ok(summary.summary_text)
    }

    /// Record an episode source linking an email body to a transcription.
    pub async fn post_episode_source(
        &self,
        transcription_id: &str,
        source_text: &str,
        matched_url: &str,
        email_subject: Option<&str>,
        email_from: Option<&str>,
    ) -> Result<()> {
        let response = self
            .http
            .post(self.url("/api/episode-sources"))
            .json(&json!({
                "transcription_id": transcription_id,
                "source_text": source_text,
                "matched_url": matched_url,
                "email_subject": email_subject,
                "email_from": email_from,
            }))
            .send()
            .await
            .context("episode source post failed")?;
        if !response.status().is_success() {
            bail!("episode source post returned {}", response.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(text: Option<&str>, html: Option<&str>) -> ParsedEmail {
        ParsedEmail {
            subject: String::new(),
            from_addr: None,
            text: text.map(str::to_string),
            html: html.map(str::to_string),
        }
    }

    #[test]
    fn urls_come_from_text_and_html_in_order() {
        let parsed = email(
            Some("watch https://youtu.be/abc12345678 now."),
            Some(r#"<p>see <a href="https://example.com/ep.mp3">this</a> and https://youtu.be/abc12345678</p>"#),
        );
        let urls = extract_urls(&parsed);
        assert_eq!(
            urls,
            vec![
                "https://youtu.be/abc12345678".to_string(),
                "https://example.com/ep.mp3".to_string(),
            ]
        );
    }

    #[test]
    fn trailing_punctuation_is_stripped() {
        let parsed = email(Some("link: https://youtu.be/abc12345678."), None);
        assert_eq!(extract_urls(&parsed), vec!["https://youtu.be/abc12345678"]);
    }

    #[test]
    fn transcribable_classification() {
        assert!(is_transcribable("https://youtu.be/abc12345678"));
        assert!(is_transcribable(
            "https://podcasts.apple.com/us/podcast/x/id1?i=1000633456789"
        ));
        assert!(is_transcribable(
            "https://podcastaddict.com/show/episode/215066511"
        ));
        assert!(is_transcribable("https://example.com/audio.mp3"));
        assert!(!is_transcribable("https://example.com/article.html"));
        assert!(!is_transcribable("not a url"));
    }

    #[test]
    fn episode_sources_accept_only_apple_and_youtube() {
        assert!(is_episode_source_url("https://youtu.be/abc12345678"));
        assert!(is_episode_source_url(
            "https://www.youtube.com/shorts/abc12345678"
        ));
        assert!(is_episode_source_url(
            "https://podcasts.apple.com/us/podcast/x/id1?i=1000633456789"
        ));
        assert!(!is_episode_source_url("https://example.com/audio.mp3"));
        assert!(!is_episode_source_url(
            "https://podcastaddict.com/show/episode/215066511"
        ));
    }

    #[test]
    fn subject_tag_matches_first_known_word() {
        let known = vec!["podcast".to_string(), "recipe".to_string()];
        assert_eq!(
            tag_from_subject("Podcast from today", &known, "default"),
            "podcast"
        );
        assert_eq!(
            tag_from_subject("please do the Recipe podcast", &known, "default"),
            "recipe"
        );
        assert_eq!(tag_from_subject("nothing known", &known, "default"), "default");
        assert_eq!(tag_from_subject("", &known, "default"), "default");
    }

    #[test]
    fn plain_body_degrades_html() {
        let parsed = email(None, Some("<p>Hello <b>world</b></p>"));
        let body = parsed.plain_body();
        assert!(body.contains("Hello"));
        assert!(body.contains("world"));
        assert!(!body.contains("<p>"));
    }

    #[test]
    fn parse_email_reads_subject_sender_and_body() {
        let raw = concat!(
            "From: Alice <alice@example.com>\r\n",
            "To: scribe@example.com\r\n",
            "Subject: podcast episode\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "https://youtu.be/abc12345678\r\n",
        );
        let parsed = parse_email(raw.as_bytes());
        assert_eq!(parsed.subject, "podcast episode");
        assert_eq!(parsed.from_addr.as_deref(), Some("alice@example.com"));
        assert!(parsed.text.unwrap().contains("youtu.be"));
    }
}
