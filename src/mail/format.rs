use anyhow::{Context, Result};
use lettre::Message;
use lettre::message::{MultiPart, header::ContentType};

/// Everything needed to render one success email.
#[derive(Debug, Clone, Default)]
pub struct SuccessEmailData<'a> {
    pub title: &'a str,
    pub source_url: &'a str,
    pub channel: Option<&'a str>,
    pub duration_seconds: Option<f64>,
    pub transcribed_at: Option<&'a str>,
    pub summary_html: &'a str,
    pub transcript_text: &'a str,
    pub source_context: Option<&'a str>,
    /// Verification line placed before everything else (episode sources).
    pub preamble: Option<&'a str>,
}

/// Render the HTML and plain-text alternatives of a success email.
///
/// The summary arrives as inner HTML from the LLM and is embedded verbatim;
/// the transcript is escaped. The plain alternative degrades the summary
/// HTML to readable text.
pub fn render_success_email(data: &SuccessEmailData<'_>) -> (String, String) {
    let duration = data.duration_seconds.map(format_duration);
    let mut html = String::new();

    if let Some(preamble) = data.preamble {
        html.push_str(&format!("<p>{}</p>\n", escape_html(preamble)));
    }
    html.push_str("<h2>");
    html.push_str(&escape_html(data.title));
    html.push_str("</h2>\n<ul>\n");
    html.push_str(&format!(
        "<li><strong>Source:</strong> <a href=\"{0}\">{0}</a></li>\n",
        escape_html(data.source_url)
    ));
    if let Some(channel) = data.channel {
        html.push_str(&format!(
            "<li><strong>Channel:</strong> {}</li>\n",
            escape_html(channel)
        ));
    }
    if let Some(duration) = &duration {
        html.push_str(&format!("<li><strong>Duration:</strong> {duration}</li>\n"));
    }
    if let Some(at) = data.transcribed_at {
        html.push_str(&format!(
            "<li><strong>Transcribed:</strong> {}</li>\n",
            escape_html(at)
        ));
    }
    html.push_str("</ul>\n<h2>Summary</h2>\n");
    html.push_str(data.summary_html);
    html.push('\n');
    if let Some(notes) = data.source_context {
        html.push_str("<h2>Creator's Notes</h2>\n<p>");
        html.push_str(&escape_html(notes).replace('\n', "<br>"));
        html.push_str("</p>\n");
    }
    html.push_str("<h2>Transcript</h2>\n<p>");
    html.push_str(&escape_html(data.transcript_text).replace('\n', "<br>"));
    html.push_str("</p>\n");

    let summary_plain = html2text::from_read(data.summary_html.as_bytes(), 80)
        .unwrap_or_else(|_| data.summary_html.to_string());

    let mut plain = String::new();
    if let Some(preamble) = data.preamble {
        plain.push_str(preamble);
        plain.push_str("\n\n");
    }
    plain.push_str(data.title);
    plain.push('\n');
    plain.push_str(&format!("Source: {}\n", data.source_url));
    if let Some(channel) = data.channel {
        plain.push_str(&format!("Channel: {channel}\n"));
    }
    if let Some(duration) = &duration {
        plain.push_str(&format!("Duration: {duration}\n"));
    }
    if let Some(at) = data.transcribed_at {
        plain.push_str(&format!("Transcribed: {at}\n"));
    }
    plain.push_str("\n--- SUMMARY ---\n\n");
    plain.push_str(summary_plain.trim());
    plain.push('\n');
    if let Some(notes) = data.source_context {
        plain.push_str("\n--- CREATOR'S NOTES ---\n\n");
        plain.push_str(notes.trim());
        plain.push('\n');
    }
    plain.push_str("\n--- TRANSCRIPT ---\n\n");
    plain.push_str(data.transcript_text);
    plain.push('\n');

    (html, plain)
}

/// Notice sent back when a message carried nothing we can transcribe.
pub fn render_no_urls_notice(subject: &str) -> String {
    format!(
        "Hello,\n\n\
         Your message \"{subject}\" did not contain any transcribable URLs.\n\n\
         Scribe accepts YouTube videos, Apple Podcasts episodes, Podcast Addict \
         episodes, and direct links to audio files (mp3, m4a, wav, ogg, flac, aac).\n\n\
         — Scribe"
    )
}

/// Notice sent back when a submission ended in failure.
pub fn render_error_notice(url: &str, error: &str) -> String {
    format!(
        "Hello,\n\n\
         Scribe could not process this URL:\n\n  {url}\n\n\
         Reason: {error}\n\n\
         — Scribe"
    )
}

/// Multipart success message (plain + HTML alternatives).
pub fn build_result_message(
    from: &str,
    to: &str,
    subject: &str,
    html: String,
    plain: String,
) -> Result<Message> {
    Message::builder()
        .from(from.parse().context("invalid sender address")?)
        .to(to.parse().context("invalid recipient address")?)
        .subject(subject)
        .multipart(MultiPart::alternative_plain_html(plain, html))
        .context("failed to build result email")
}

/// Single-part plain-text message for notices and errors.
pub fn build_notice_message(from: &str, to: &str, subject: &str, body: String) -> Result<Message> {
    Message::builder()
        .from(from.parse().context("invalid sender address")?)
        .to(to.parse().context("invalid recipient address")?)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN)
        .body(body)
        .context("failed to build notice email")
}

pub fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SuccessEmailData<'static> {
        SuccessEmailData {
            title: "Bread & Butter",
            source_url: "https://youtu.be/abc12345678",
            channel: Some("Baking Hour"),
            duration_seconds: Some(3725.0),
            transcribed_at: Some("2026-03-01T12:00:00Z"),
            summary_html: "<h3>Key points</h3><ul><li>Use a starter</li></ul>",
            transcript_text: "First line.\nSecond line with <tags>.",
            source_context: None,
            preamble: None,
        }
    }

    #[test]
    fn html_embeds_summary_verbatim_and_escapes_transcript() {
        let (html, _plain) = render_success_email(&sample());
        assert!(html.contains("<h3>Key points</h3><ul><li>Use a starter</li></ul>"));
        assert!(html.contains("Second line with &lt;tags&gt;."));
        assert!(html.contains("First line.<br>Second line"));
        assert!(html.contains("Bread &amp; Butter"));
        assert!(html.contains("Duration:</strong> 1h 2m"));
    }

    #[test]
    fn plain_uses_section_separators_and_degraded_summary() {
        let (_html, plain) = render_success_email(&sample());
        assert!(plain.contains("--- SUMMARY ---"));
        assert!(plain.contains("--- TRANSCRIPT ---"));
        assert!(!plain.contains("--- CREATOR'S NOTES ---"));
        assert!(plain.contains("Use a starter"));
        assert!(!plain.contains("<ul>"));
    }

    #[test]
    fn creator_notes_section_sits_between_summary_and_transcript() {
        let mut data = sample();
        data.source_context = Some("Show notes here");
        let (html, plain) = render_success_email(&data);

        let summary_at = html.find("<h2>Summary</h2>").unwrap();
        let notes_at = html.find("<h2>Creator's Notes</h2>").unwrap();
        let transcript_at = html.find("<h2>Transcript</h2>").unwrap();
        assert!(summary_at < notes_at && notes_at < transcript_at);

        let notes_at = plain.find("--- CREATOR'S NOTES ---").unwrap();
        let transcript_at = plain.find("--- TRANSCRIPT ---").unwrap();
        assert!(notes_at < transcript_at);
    }

    #[test]
    fn preamble_leads_both_alternatives() {
        let mut data = sample();
        data.preamble = Some("Matched URL: https://youtu.be/abc12345678");
        let (html, plain) = render_success_email(&data);
        assert!(html.starts_with("<p>Matched URL:"));
        assert!(plain.starts_with("Matched URL: https://youtu.be/abc12345678"));
    }

    #[test]
    fn durations_render_compactly() {
        assert_eq!(format_duration(42.0), "42s");
        assert_eq!(format_duration(754.0), "12m 34s");
        assert_eq!(format_duration(3725.0), "1h 2m");
    }

    #[test]
    fn messages_build_with_valid_addresses() {
        let (html, plain) = render_success_email(&sample());
        assert!(
            build_result_message("scribe@example.com", "user@example.com", "done", html, plain)
                .is_ok()
        );
        assert!(
            build_notice_message(
                "scribe@example.com",
                "user@example.com",
                "Scribe error",
                render_no_urls_notice("hello"),
            )
            .is_ok()
        );
    }
}
