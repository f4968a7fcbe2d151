use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::json;
use tokio::task;
use tracing::{debug, info};

use crate::store::{JobStatus, Store, SummaryRecord};
use crate::tagconfig::{ConfigOverrides, TagConfigStore};

/// Suffix appended to the system prompt when the caller wants HTML output
/// suitable for embedding in an email body.
pub const HTML_FORMAT_SUFFIX: &str = "Format your response using valid HTML elements \
(headings, paragraphs, lists, tables, etc.). Do not include <html>, <head>, or <body> \
tags - only the inner content.";

/// Failure classification surfaced to the HTTP layer.
#[derive(Debug)]
pub enum SummarizeError {
    /// Unknown transcription id.
    MissingTranscription(String),
    /// The transcription exists but has no completed text yet.
    IncompleteTranscription(String),
    /// The LLM call failed (network, timeout, or malformed response).
    Llm(anyhow::Error),
    /// Store or composition failure on our side.
    Internal(anyhow::Error),
}

impl std::fmt::Display for SummarizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SummarizeError::MissingTranscription(id) => {
                write!(f, "transcription '{id}' not found")
            }
            SummarizeError::IncompleteTranscription(id) => {
                write!(f, "transcription '{id}' has no completed transcript")
            }
            SummarizeError::Llm(err) => write!(f, "summary generation failed: {err}"),
            SummarizeError::Internal(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SummarizeError {}

/// Parameters for one summary generation.
#[derive(Debug, Clone, Default)]
pub struct SummaryRequest {
    pub overrides: ConfigOverrides,
    pub system_prompt_suffix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: Option<i64>,
    #[serde(default)]
    completion_tokens: Option<i64>,
}

/// Generates and persists LLM summaries for completed transcriptions.
pub struct Summarizer {
    store: Arc<Store>,
    tag_configs: TagConfigStore,
    http: reqwest::Client,
    timeout: Duration,
}

impl Summarizer {
    pub fn new(store: Arc<Store>, tag_configs: TagConfigStore, timeout: Duration) -> Self {
        Self {
            store,
            tag_configs,
            http: reqwest::Client::new(),
            timeout,
        }
    }

    /// Generate a summary for a completed transcription and persist it.
    pub async fn summarize(
        &self,
        transcription_id: &str,
        request: SummaryRequest,
    ) -> Result<SummaryRecord, SummarizeError> {
        let store = Arc::clone(&self.store);
        let id = transcription_id.to_string();
        let record = task::spawn_blocking(move || store.get(&id))
            .await
            .map_err(|err| SummarizeError::Internal(anyhow!(err)))?
            .map_err(SummarizeError::Internal)?
            .ok_or_else(|| SummarizeError::MissingTranscription(transcription_id.to_string()))?;

        if record.status != JobStatus::Completed {
            return Err(SummarizeError::IncompleteTranscription(record.id));
        }
        let full_text = record
            .full_text
            .clone()
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| SummarizeError::IncompleteTranscription(record.id.clone()))?;

        let resolved = self
            .tag_configs
            .resolve(&record.tags, &request.overrides)
            .map_err(SummarizeError::Internal)?;

        let mut system_prompt = resolved.system_prompt.clone();
        if let Some(suffix) = &request.system_prompt_suffix {
            if !suffix.trim().is_empty() {
                system_prompt.push_str("\n\n");
                system_prompt.push_str(suffix);
            }
        }

        let user_message = compose_user_message(record.source_context.as_deref(), &full_text);

        let started = Instant::now();
        let (summary_text, usage) = self
            .chat_completion(&resolved.api_endpoint, &resolved.model, &resolved.api_key, &system_prompt, &user_message)
            .await
            .map_err(SummarizeError::Llm)?;
        let generation_ms = started.elapsed().as_millis() as i64;

        info!(
            transcription = %record.id,
            model = %resolved.model,
            config_source = %resolved.config_source,
            generation_ms,
            "generated summary"
        );

        let store = Arc::clone(&self.store);
        let persisted = {
            let record_id = record.id.clone();
            let endpoint = resolved.api_endpoint.clone();
            let model = resolved.model.clone();
            let api_key_used = resolved.api_key_used();
            let tags = record.tags.clone();
            let config_source = resolved.config_source.clone();
            task::spawn_blocking(move || {
                store.insert_summary(
                    &record_id,
                    &endpoint,
                    &model,
                    &system_prompt,
                    api_key_used,
                    &tags,
                    &config_source,
                    &summary_text,
                    generation_ms,
                    usage.as_ref().and_then(|usage| usage.prompt_tokens),
                    usage.as_ref().and_then(|usage| usage.completion_tokens),
                )
            })
            .await
            .map_err(|err| SummarizeError::Internal(anyhow!(err)))?
            .map_err(SummarizeError::Internal)?
        };

        Ok(persisted)
    }

    async fn chat_completion(
        &self,
        endpoint: &str,
        model: &str,
        api_key: &str,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<(String, Option<ChatUsage>)> {
        let url = join_endpoint(endpoint, "chat/completions");
        let payload = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_message},
            ],
        });

        let mut request = self.http.post(&url).timeout(self.timeout).json(&payload);
        if !api_key.is_empty() {
            request = request.bearer_auth(api_key);
        }

        debug!(url, model, "requesting chat completion");
        let response = request
            .send()
            .await
            .with_context(|| format!("LLM request to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM endpoint returned {status}: {}", body.trim());
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .context("malformed response from LLM chat endpoint")?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .map(|message| message.content)
            .filter(|content| !content.trim().is_empty())
            .context("LLM response contained no completion text")?;
        Ok((content, parsed.usage))
    }
}

/// Compose the user message: optional creator's-notes preamble, then the
/// transcript.
fn compose_user_message(source_context: Option<&str>, full_text: &str) -> String {
    match source_context.filter(|context| !context.trim().is_empty()) {
        Some(context) => format!(
            "The creator provided the following show notes for this episode:\n\n---\n{context}\n---\n\n\
             If any of this context is relevant to the summarization task below, use it to guide \
             what you extract. Ignore any show notes content that isn't relevant to the specific \
             request.\n\nTranscript:\n{full_text}"
        ),
        None => format!("Transcript:\n{full_text}"),
    }
}

fn join_endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_includes_show_notes_block() {
        let message = compose_user_message(Some("Episode about sourdough"), "full transcript");
        assert!(message.starts_with("The creator provided the following show notes"));
        assert!(message.contains("---\nEpisode about sourdough\n---"));
        assert!(message.ends_with("Transcript:\nfull transcript"));
    }

    #[test]
    fn user_message_without_notes_is_transcript_only() {
        let message = compose_user_message(None, "full transcript");
        assert_eq!(message, "Transcript:\nfull transcript");
        assert_eq!(compose_user_message(Some("   "), "text"), "Transcript:\ntext");
    }

    #[test]
    fn endpoint_join_tolerates_trailing_slash() {
        assert_eq!(
            join_endpoint("https://api.openai.com/v1/", "chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            join_endpoint("https://api.openai.com/v1", "chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn completion_response_parses_usage() {
        let raw = r#"{
            "choices": [{"message": {"role": "assistant", "content": "<p>Summary</p>"}}],
            "usage": {"prompt_tokens": 900, "completion_tokens": 120, "total_tokens": 1020}
        }"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        let usage = parsed.usage.unwrap();
        assert_eq!(usage.prompt_tokens, Some(900));
        assert_eq!(usage.completion_tokens, Some(120));
        assert_eq!(parsed.choices[0].message.as_ref().unwrap().content, "<p>Summary</p>");
    }
}
