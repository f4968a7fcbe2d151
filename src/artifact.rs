use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

/// Seconds of silence after a sentence end that forces a paragraph break in
/// the plain-text export.
const PARAGRAPH_GAP_SECS: f64 = 2.0;

/// One ASR-produced span of speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: i64,
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Source block of a persisted transcript artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

/// Transcription block of a persisted transcript artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactTranscription {
    pub language: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub segments: Vec<Segment>,
}

/// The on-disk JSON artifact owned by one transcription record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptArtifact {
    pub id: String,
    pub source: ArtifactSource,
    pub transcription: ArtifactTranscription,
    pub full_text: String,
    pub word_count: usize,
    pub segments_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Persistent store for transcript artifacts, organised as
/// `<root>/<year>/<month>/<id>.json`.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create artifact directory {}", root.display()))?;
        Ok(Self { root })
    }

    /// Path a new artifact will be written to, keyed by its creation month.
    pub fn path_for(&self, id: &str, created_at: DateTime<Utc>) -> PathBuf {
        self.root
            .join(format!("{:04}", created_at.year()))
            .join(format!("{:02}", created_at.month()))
            .join(format!("{id}.json"))
    }

    /// Persist an artifact atomically (temp file then rename) and return its
    /// final path.
    pub fn save(&self, artifact: &TranscriptArtifact) -> Result<PathBuf> {
        let path = self.path_for(&artifact.id, artifact.created_at);
        let parent = path
            .parent()
            .context("artifact path has no parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create artifact directory {}", parent.display()))?;

        let serialised = serde_json::to_string_pretty(artifact)
            .context("failed to serialise transcript artifact")?;
        let tmp = parent.join(format!(".{}.json.tmp", artifact.id));
        fs::write(&tmp, serialised)
            .with_context(|| format!("failed to write artifact {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move artifact into place at {}", path.display()))?;
        Ok(path)
    }

    /// Locate an artifact file across year/month subdirectories.
    pub fn find_path(&self, id: &str) -> Option<PathBuf> {
        let file_name = format!("{id}.json");
        let years = fs::read_dir(&self.root).ok()?;
        for year in years.flatten() {
            if !year.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                continue;
            }
            let months = match fs::read_dir(year.path()) {
                Ok(months) => months,
                Err(_) => continue,
            };
            for month in months.flatten() {
                let candidate = month.path().join(&file_name);
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Load the raw JSON document for an id. Unknown ids are absence, not
    /// an error.
    pub fn load_raw(&self, id: &str) -> Result<Option<String>> {
        let Some(path) = self.find_path(id) else {
            return Ok(None);
        };
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read artifact {}", path.display()))?;
        Ok(Some(raw))
    }

    pub fn load(&self, id: &str) -> Result<Option<TranscriptArtifact>> {
        let Some(raw) = self.load_raw(id)? else {
            return Ok(None);
        };
        let artifact: TranscriptArtifact = serde_json::from_str(&raw)
            .with_context(|| format!("malformed artifact JSON for {id}"))?;
        Ok(Some(artifact))
    }

    /// Remove the artifact for an id, wherever it lives. Returns whether a
    /// file was deleted.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let Some(path) = self.find_path(id) else {
            return Ok(false);
        };
        fs::remove_file(&path)
            .with_context(|| format!("failed to delete artifact {}", path.display()))?;
        Ok(true)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Space-join of trimmed segment texts, skipping empty segments.
pub fn full_text(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|segment| segment.text.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Render segments as SubRip: 1-based index, timestamp range, text, blank
/// line.
pub fn to_srt(segments: &[Segment]) -> String {
    let mut out = String::new();
    for (index, segment) in segments.iter().enumerate() {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            index + 1,
            srt_timestamp(segment.start),
            srt_timestamp(segment.end),
            segment.text.trim()
        ));
    }
    out
}

fn srt_timestamp(seconds: f64) -> String {
    let total_millis = (seconds.max(0.0) * 1000.0).round() as u64;
    let millis = total_millis % 1000;
    let total_secs = total_millis / 1000;
    format!(
        "{:02}:{:02}:{:02},{:03}",
        total_secs / 3600,
        (total_secs % 3600) / 60,
        total_secs % 60,
        millis
    )
}

/// Compose segments into readable prose.
///
/// Segment texts are joined with single spaces. When a segment ends a
/// sentence (`.`, `?`, `!`) and the following segment starts at least
/// [`PARAGRAPH_GAP_SECS`] later, the buffered sentence run becomes its own
/// paragraph. Paragraphs are joined by blank lines.
pub fn to_plain_text(segments: &[Segment]) -> String {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut buffer = String::new();

    for (index, segment) in segments.iter().enumerate() {
        let text = segment.text.trim();
        if text.is_empty() {
            continue;
        }
        if !buffer.is_empty() {
            buffer.push(' ');
        }
        buffer.push_str(text);

        let sentence_end = text.ends_with('.') || text.ends_with('?') || text.ends_with('!');
        if sentence_end {
            if let Some(next) = segments.get(index + 1) {
                if next.start - segment.end >= PARAGRAPH_GAP_SECS {
                    paragraphs.push(std::mem::take(&mut buffer));
                }
            }
        }
    }

    if !buffer.is_empty() {
        paragraphs.push(buffer);
    }
    paragraphs.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn segment(id: i64, start: f64, end: f64, text: &str) -> Segment {
        Segment {
            id,
            start,
            end,
            text: text.into(),
        }
    }

    fn sample_artifact(id: &str) -> TranscriptArtifact {
        let segments = vec![segment(0, 0.0, 1.0, "Hello."), segment(1, 1.0, 2.0, "World.")];
        let text = full_text(&segments);
        TranscriptArtifact {
            id: id.into(),
            source: ArtifactSource {
                source_type: "youtube".into(),
                url: "https://youtu.be/abc12345678".into(),
                title: Some("Sample".into()),
                channel: None,
                thumbnail_url: None,
                upload_date: None,
                duration_seconds: Some(2.0),
            },
            transcription: ArtifactTranscription {
                language: "en".into(),
                model: "whisper-large".into(),
                duration_seconds: Some(2.0),
                segments,
            },
            word_count: word_count(&text),
            segments_count: 2,
            full_text: text,
            created_at: "2026-03-01T12:00:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn save_load_roundtrip_is_byte_identical() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf()).unwrap();
        let artifact = sample_artifact("youtube_abc12345678");

        let path = store.save(&artifact).unwrap();
        assert!(path.ends_with("2026/03/youtube_abc12345678.json"));

        let raw = store.load_raw("youtube_abc12345678").unwrap().unwrap();
        let reloaded = store.load("youtube_abc12345678").unwrap().unwrap();
        assert_eq!(serde_json::to_string_pretty(&reloaded).unwrap(), raw);
    }

    #[test]
    fn unknown_id_is_absent_not_an_error() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf()).unwrap();
        assert!(store.load("missing").unwrap().is_none());
        assert!(!store.delete("missing").unwrap());
    }

    #[test]
    fn delete_reaches_across_months() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf()).unwrap();
        let mut artifact = sample_artifact("apple_podcasts_42");
        artifact.created_at = "2025-11-30T23:59:00Z".parse().unwrap();
        store.save(&artifact).unwrap();

        assert!(store.delete("apple_podcasts_42").unwrap());
        assert!(store.load("apple_podcasts_42").unwrap().is_none());
    }

    #[test]
    fn srt_formats_timestamps_with_millis() {
        let rendered = to_srt(&[segment(0, 1.5, 2.25, "Hi")]);
        assert_eq!(rendered, "1\n00:00:01,500 --> 00:00:02,250\nHi\n\n");
    }

    #[test]
    fn srt_indexes_are_one_based() {
        let rendered = to_srt(&[
            segment(0, 0.0, 1.0, "One"),
            segment(1, 3661.0, 3662.5, "Two"),
        ]);
        assert!(rendered.starts_with("1\n00:00:00,000 --> 00:00:01,000\nOne\n\n2\n"));
        assert!(rendered.contains("01:01:01,000 --> 01:01:02,500"));
    }

    #[test]
    fn plain_text_breaks_paragraph_on_long_gap() {
        let segments = vec![
            segment(0, 0.0, 1.0, "Hello."),
            segment(1, 1.0, 2.0, "World."),
            segment(2, 5.0, 6.0, "Next."),
        ];
        assert_eq!(to_plain_text(&segments), "Hello. World.\n\nNext.");
    }

    #[test]
    fn plain_text_ignores_gap_mid_sentence() {
        let segments = vec![
            segment(0, 0.0, 1.0, "carried over"),
            segment(1, 5.0, 6.0, "and finished."),
        ];
        assert_eq!(to_plain_text(&segments), "carried over and finished.");
    }

    #[test]
    fn full_text_trims_and_skips_empty() {
        let segments = vec![
            segment(0, 0.0, 1.0, "  Hello  "),
            segment(1, 1.0, 2.0, "   "),
            segment(2, 2.0, 3.0, "there"),
        ];
        assert_eq!(full_text(&segments), "Hello there");
        assert_eq!(word_count(&full_text(&segments)), 2);
    }
}
