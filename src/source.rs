use anyhow::{Result, bail};
use regex::Regex;
use std::sync::OnceLock;
use url::Url;

/// Audio file extensions accepted as direct-audio submissions.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "wav", "ogg", "flac", "aac"];

/// Classified origin of a submission URL.
///
/// The canonical id is a pure function of the variant payload, so two
/// submissions of the same URL always collapse onto the same record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    YouTube { video_id: String },
    ApplePodcasts { episode_id: u64 },
    PodcastAddict { episode_id: u64 },
    DirectAudio { digest: String },
}

impl MediaSource {
    pub fn canonical_id(&self) -> String {
        match self {
            MediaSource::YouTube { video_id } => format!("youtube_{video_id}"),
            MediaSource::ApplePodcasts { episode_id } => format!("apple_podcasts_{episode_id}"),
            MediaSource::PodcastAddict { episode_id } => format!("podcast_addict_{episode_id}"),
            MediaSource::DirectAudio { digest } => format!("direct_audio_{digest}"),
        }
    }

    pub fn source_type(&self) -> &'static str {
        match self {
            MediaSource::YouTube { .. } => "youtube",
            MediaSource::ApplePodcasts { .. } => "apple_podcasts",
            MediaSource::PodcastAddict { .. } => "podcast_addict",
            MediaSource::DirectAudio { .. } => "direct_audio",
        }
    }
}

impl std::fmt::Display for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.source_type())
    }
}

/// A submission URL resolved to its source classification.
#[derive(Debug, Clone)]
pub struct ParsedSource {
    pub source: MediaSource,
    pub source_url: String,
}

impl ParsedSource {
    pub fn canonical_id(&self) -> String {
        self.source.canonical_id()
    }
}

fn video_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").unwrap())
}

fn episode_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)/episode/(\d+)").unwrap())
}

fn apple_id_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/id(\d+)").unwrap())
}

fn is_youtube_host(host: &str) -> bool {
    host == "youtube.com" || host.ends_with(".youtube.com")
}

fn is_host(host: &str, base: &str) -> bool {
    host == base || host == format!("www.{base}")
}

/// Classify a submission URL and derive its canonical id.
///
/// Rules are applied in order: YouTube forms, Apple Podcasts, Podcast
/// Addict, then anything else falls through to a direct-audio digest of the
/// URL itself. A URL that matches a platform host but carries no usable
/// episode/video id is rejected rather than hashed.
pub fn parse_source_url(raw: &str) -> Result<ParsedSource> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("URL must not be empty");
    }
    let url = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(err) => bail!("invalid URL '{trimmed}': {err}"),
    };
    if !matches!(url.scheme(), "http" | "https") {
        bail!("unsupported URL scheme '{}'", url.scheme());
    }
    let Some(host) = url.host_str().map(|host| host.to_ascii_lowercase()) else {
        bail!("URL '{trimmed}' has no host");
    };

    if let Some(source) = parse_youtube(&url, &host)? {
        return Ok(ParsedSource {
            source,
            source_url: trimmed.to_string(),
        });
    }

    if host == "podcasts.apple.com" {
        let episode_id = apple_episode_id(&url)?;
        return Ok(ParsedSource {
            source: MediaSource::ApplePodcasts { episode_id },
            source_url: trimmed.to_string(),
        });
    }

    if is_host(&host, "podcastaddict.com") {
        if let Some(captures) = episode_path_re().captures(url.path()) {
            if let Ok(episode_id) = captures[1].parse::<u64>() {
                return Ok(ParsedSource {
                    source: MediaSource::PodcastAddict { episode_id },
                    source_url: trimmed.to_string(),
                });
            }
        }
    }

    let digest = format!("{:x}", md5::compute(trimmed.as_bytes()));
    Ok(ParsedSource {
        source: MediaSource::DirectAudio {
            digest: digest[..12].to_string(),
        },
        source_url: trimmed.to_string(),
    })
}

fn parse_youtube(url: &Url, host: &str) -> Result<Option<MediaSource>> {
    let candidate = if host == "youtu.be" {
        url.path_segments()
            .and_then(|mut segments| segments.next())
            .map(|segment| segment.to_string())
    } else if is_youtube_host(host) {
        let path = url.path();
        if path == "/watch" {
            url.query_pairs()
                .find(|(key, _)| key == "v")
                .map(|(_, value)| value.into_owned())
        } else if let Some(rest) = path
            .strip_prefix("/embed/")
            .or_else(|| path.strip_prefix("/live/"))
            .or_else(|| path.strip_prefix("/shorts/"))
        {
            Some(rest.trim_end_matches('/').to_string())
        } else {
            None
        }
    } else {
        return Ok(None);
    };

    match candidate {
        Some(id) if video_id_re().is_match(&id) => Ok(Some(MediaSource::YouTube { video_id: id })),
        _ => bail!("no YouTube video id found in '{url}'"),
    }
}

fn apple_episode_id(url: &Url) -> Result<u64> {
    if let Some((_, value)) = url.query_pairs().find(|(key, _)| key == "i") {
        if let Ok(id) = value.parse::<u64>() {
            return Ok(id);
        }
    }
    if let Some(captures) = apple_id_path_re().captures(url.path()) {
        if let Ok(id) = captures[1].parse::<u64>() {
            return Ok(id);
        }
    }
    bail!("no Apple Podcasts episode id found in '{url}'")
}

/// Extension of a direct-audio URL, when its path names a supported format.
pub fn direct_audio_extension(raw: &str) -> Option<&'static str> {
    let url = Url::parse(raw.trim()).ok()?;
    let path = url.path().to_ascii_lowercase();
    AUDIO_EXTENSIONS
        .iter()
        .find(|ext| path.ends_with(&format!(".{ext}")))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn youtube_forms_share_one_id() {
        let forms = [
            "https://www.youtube.com/watch?v=abc12345678",
            "https://youtu.be/abc12345678",
            "https://youtube.com/embed/abc12345678",
            "https://www.youtube.com/live/abc12345678",
            "https://www.youtube.com/shorts/abc12345678",
        ];
        for form in forms {
            let parsed = parse_source_url(form).unwrap();
            assert_eq!(parsed.canonical_id(), "youtube_abc12345678", "{form}");
            assert_eq!(parsed.source.source_type(), "youtube");
        }
    }

    #[test]
    fn youtube_host_without_id_is_rejected() {
        assert!(parse_source_url("https://www.youtube.com/watch?v=short").is_err());
        assert!(parse_source_url("https://www.youtube.com/playlist?list=x").is_err());
        assert!(parse_source_url("https://youtu.be/").is_err());
    }

    #[test]
    fn apple_episode_query_takes_precedence() {
        let parsed =
            parse_source_url("https://podcasts.apple.com/us/podcast/show/id111?i=1000633456789")
                .unwrap();
        assert_eq!(parsed.canonical_id(), "apple_podcasts_1000633456789");

        let fallback =
            parse_source_url("https://podcasts.apple.com/us/podcast/show/id111222333").unwrap();
        assert_eq!(fallback.canonical_id(), "apple_podcasts_111222333");

        assert!(parse_source_url("https://podcasts.apple.com/us/podcast/show").is_err());
    }

    #[test]
    fn podcast_addict_is_case_insensitive() {
        let parsed =
            parse_source_url("https://podcastaddict.com/Hard-Fork/episode/215066511").unwrap();
        assert_eq!(parsed.canonical_id(), "podcast_addict_215066511");

        let upper =
            parse_source_url("https://www.PodcastAddict.com/Hard-Fork/EPISODE/215066511").unwrap();
        assert_eq!(upper.canonical_id(), "podcast_addict_215066511");
    }

    #[test]
    fn direct_audio_digest_is_deterministic() {
        let first = parse_source_url("https://example.com/feed/show.mp3").unwrap();
        let second = parse_source_url("https://example.com/feed/show.mp3").unwrap();
        assert_eq!(first.canonical_id(), second.canonical_id());
        assert!(first.canonical_id().starts_with("direct_audio_"));
        assert_eq!(first.canonical_id().len(), "direct_audio_".len() + 12);
    }

    #[test]
    fn missing_scheme_or_host_fails() {
        assert!(parse_source_url("").is_err());
        assert!(parse_source_url("not a url").is_err());
        assert!(parse_source_url("ftp://example.com/a.mp3").is_err());
    }

    #[test]
    fn audio_extension_detection() {
        assert_eq!(
            direct_audio_extension("https://example.com/ep.mp3?sig=1"),
            Some("mp3")
        );
        assert_eq!(
            direct_audio_extension("https://example.com/ep.FLAC"),
            Some("flac")
        );
        assert_eq!(direct_audio_extension("https://example.com/page.html"), None);
    }
}
