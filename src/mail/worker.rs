use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{MailFolders, MailSettings};
use crate::mail::format::{
    SuccessEmailData, build_notice_message, build_result_message, render_error_notice,
    render_no_urls_notice, render_success_email,
};
use crate::mail::{
    FrontendClient, ParsedEmail, RemoteSubmitOutcome, RemoteTranscription, extract_urls,
    is_episode_source_url, is_transcribable, parse_email, tag_from_subject,
};

/// Delays between retries of transient IMAP/SMTP failures.
const BACKOFF_DELAYS_SECS: [u64; 3] = [5, 15, 45];

/// Socket timeout for each IMAP operation.
const IMAP_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Tag applied to every newsletter submission.
const EPISODE_SOURCES_TAG: &str = "digest";

/// Which mail pipeline a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipeline {
    Scribe,
    EpisodeSources,
}

/// Where a processed message ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Done,
    Error,
}

/// A message pulled from an inbox, already flagged `\Seen`.
#[derive(Debug)]
struct FetchedMessage {
    uid: u32,
    raw: Vec<u8>,
}

/// The IMAP/SMTP worker: polls the inboxes, runs each message through the
/// transcription pipeline, and routes results by email.
pub struct MailWorker {
    settings: MailSettings,
    frontend: FrontendClient,
    smtp: AsyncSmtpTransport<Tokio1Executor>,
    semaphore: Arc<Semaphore>,
}

impl MailWorker {
    pub fn new(settings: MailSettings) -> Result<Arc<Self>> {
        if settings.imap_host.is_empty() {
            anyhow::bail!("SCRIBE_IMAP_HOST is not configured");
        }
        if settings.smtp_host.is_empty() {
            anyhow::bail!("SCRIBE_SMTP_HOST is not configured");
        }
        let smtp = build_smtp(&settings)?;
        let frontend = FrontendClient::new(&settings.frontend_url);
        let semaphore = Arc::new(Semaphore::new(settings.max_in_flight.max(1)));
        Ok(Arc::new(Self {
            settings,
            frontend,
            smtp,
            semaphore,
        }))
    }

    /// Poll until ctrl-c, letting in-flight handlers finish on shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.settings.poll_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut handlers: JoinSet<()> = JoinSet::new();

        info!(
            inbox = %self.settings.scribe_folders.inbox,
            episode_inbox = %self.settings.episode_source_folders.inbox,
            interval = self.settings.poll_interval_secs,
            "mail worker started"
        );

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received; draining in-flight handlers");
                    break;
                }
                _ = ticker.tick() => {
                    while handlers.try_join_next().is_some() {}
                    self.poll_cycle(&mut handlers).await;
                }
            }
        }

        while handlers.join_next().await.is_some() {}
        info!("mail worker stopped");
        Ok(())
    }

    async fn poll_cycle(self: &Arc<Self>, handlers: &mut JoinSet<()>) {
        for pipeline in [Pipeline::Scribe, Pipeline::EpisodeSources] {
            let inbox = self.folders(pipeline).inbox.clone();
            match self.fetch_unseen(&inbox).await {
                Ok(messages) => {
                    if !messages.is_empty() {
                        info!(folder = %inbox, count = messages.len(), "picked up new messages");
                    }
                    for message in messages {
                        let worker = Arc::clone(self);
                        handlers.spawn(async move {
                            worker.handle_message(pipeline, message).await;
                        });
                    }
                }
                Err(err) => warn!(folder = %inbox, error = %err, "inbox poll failed"),
            }
        }
    }

    fn folders(&self, pipeline: Pipeline) -> &MailFolders {
        match pipeline {
            Pipeline::Scribe => &self.settings.scribe_folders,
            Pipeline::EpisodeSources => &self.settings.episode_source_folders,
        }
    }

    async fn handle_message(self: Arc<Self>, pipeline: Pipeline, message: FetchedMessage) {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let email = parse_email(&message.raw);
        debug!(uid = message.uid, subject = %email.subject, "processing message");

        let disposition = match pipeline {
            Pipeline::Scribe => self.process_scribe(&email).await,
            Pipeline::EpisodeSources => self.process_episode_source(&email).await,
        };

        let folders = self.folders(pipeline);
        let inbox = folders.inbox.clone();
        let dest = match disposition {
            Disposition::Done => folders.done.clone(),
            Disposition::Error => folders.error.clone(),
        };
        if let Err(err) = self.move_message(&inbox, message.uid, &dest).await {
            error!(uid = message.uid, dest = %dest, error = %err, "failed to move message");
        }
    }

    /// Generic inbox: submit every transcribable URL with the tag derived
    /// from the subject, deliver results, and report per-URL failures to
    /// the sender.
    async fn process_scribe(&self, email: &ParsedEmail) -> Disposition {
        let urls: Vec<String> = extract_urls(email)
            .into_iter()
            .filter(|url| is_transcribable(url))
            .collect();

        if urls.is_empty() {
            self.notify_sender(
                email,
                "Scribe: no transcribable URLs",
                render_no_urls_notice(&email.subject),
            )
            .await;
            return Disposition::Error;
        }

        let tag = self.resolve_tag(&email.subject).await;
        let destinations = self.resolve_destinations(&tag, email).await;

        let mut any_success = false;
        for url in &urls {
            match self.handle_submission(url, &tag).await {
                Ok((record, summary_html)) => {
                    let subject = format!(
                        "Scribe: {}",
                        record.title.clone().unwrap_or_else(|| url.clone())
                    );
                    let sent = self
                        .deliver_result(&record, &summary_html, &subject, &destinations, None)
                        .await;
                    if sent {
                        any_success = true;
                    }
                }
                Err(err) => {
                    warn!(url, error = %err, "submission failed");
                    self.notify_sender(
                        email,
                        "Scribe: transcription failed",
                        render_error_notice(url, &format!("{err:#}")),
                    )
                    .await;
                }
            }
        }

        if any_success {
            Disposition::Done
        } else {
            Disposition::Error
        }
    }

    /// Newsletter inbox: first Apple/YouTube URL only, tagged `digest`,
    /// with the email body preserved as an episode source.
    async fn process_episode_source(&self, email: &ParsedEmail) -> Disposition {
        let matched = extract_urls(email)
            .into_iter()
            .find(|url| is_episode_source_url(url));
        let Some(url) = matched else {
            self.notify_sender(
                email,
                "Scribe: no transcribable URLs",
                render_no_urls_notice(&email.subject),
            )
            .await;
            return Disposition::Error;
        };

        let body_text = email.plain_body();
        let outcome = async {
            let (record, summary_html) = self.handle_submission(&url, EPISODE_SOURCES_TAG).await?;
            self.frontend
                .post_episode_source(
                    &record.id,
                    &body_text,
                    &url,
                    Some(&email.subject),
                    email.from_addr.as_deref(),
                )
                .await?;
            Ok::<_, anyhow::Error>((record, summary_html))
        }
        .await;

        match outcome {
            Ok((record, summary_html)) => {
                let return_address = if self.settings.episode_sources_return_address.is_empty() {
                    email.from_addr.clone()
                } else {
                    Some(self.settings.episode_sources_return_address.clone())
                };
                let Some(return_address) = return_address else {
                    warn!(url, "no return address for episode source result");
                    return Disposition::Error;
                };
                let subject = format!("Scribe: {}", email.subject);
                let preamble = format!("Matched URL: {url}");
                let sent = self
                    .deliver_result(
                        &record,
                        &summary_html,
                        &subject,
                        std::slice::from_ref(&return_address),
                        Some(&preamble),
                    )
                    .await;
                if sent {
                    Disposition::Done
                } else {
                    Disposition::Error
                }
            }
            Err(err) => {
                warn!(url, error = %err, "episode source processing failed");
                self.notify_sender(
                    email,
                    "Scribe: transcription failed",
                    render_error_notice(&url, &format!("{err:#}")),
                )
                .await;
                Disposition::Error
            }
        }
    }

    /// Submit one URL and wait for a completed transcription plus a fresh
    /// HTML summary. A 409 means the URL is already known; the existing
    /// record is re-summarized instead.
    async fn handle_submission(
        &self,
        url: &str,
        tag: &str,
    ) -> Result<(RemoteTranscription, String)> {
        let id = match self.frontend.submit(url, tag).await? {
            RemoteSubmitOutcome::Accepted(id) => id,
            RemoteSubmitOutcome::AlreadyKnown(id) => {
                info!(url, id = %id, "URL already transcribed; re-summarizing");
                id
            }
        };

        let record = self.frontend.wait_for_completion(&id).await?;
        if record.status != "completed" {
            let reason = record
                .error_message
                .unwrap_or_else(|| "transcription failed".into());
            anyhow::bail!("{reason}");
        }

        let summary_html = self.frontend.request_html_summary(&record.id).await?;
        Ok((record, summary_html))
    }

    /// Tag derived from the subject against the frontend's current tag
    /// set; a tag fetch failure falls back to the configured default.
    async fn resolve_tag(&self, subject: &str) -> String {
        match self.frontend.tags().await {
            Ok(known) => tag_from_subject(subject, &known, &self.settings.default_tag),
            Err(err) => {
                warn!(error = %err, "tag fetch failed; using default tag");
                self.settings.default_tag.clone()
            }
        }
    }

    /// Result addresses: the tag's configured destinations, else the
    /// default entry's, else the sender.
    async fn resolve_destinations(&self, tag: &str, email: &ParsedEmail) -> Vec<String> {
        for name in [tag, "default"] {
            match self.frontend.tag_destinations(name).await {
                Ok(Some(addresses)) => return addresses,
                Ok(None) => {}
                Err(err) => {
                    warn!(tag = name, error = %err, "tag destination lookup failed")
                }
            }
        }
        email.from_addr.clone().into_iter().collect()
    }

    async fn deliver_result(
        &self,
        record: &RemoteTranscription,
        summary_html: &str,
        subject: &str,
        destinations: &[String],
        preamble: Option<&str>,
    ) -> bool {
        if destinations.is_empty() {
            warn!(id = %record.id, "no destination for result email");
            return false;
        }

        let transcript = record.full_text.clone().unwrap_or_default();
        let data = SuccessEmailData {
            title: record.title.as_deref().unwrap_or(&record.source_url),
            source_url: &record.source_url,
            channel: record.channel.as_deref(),
            duration_seconds: record.duration_seconds,
            transcribed_at: record.transcribed_at.as_deref(),
            summary_html,
            transcript_text: &transcript,
            source_context: record.source_context.as_deref(),
            preamble,
        };
        let (html, plain) = render_success_email(&data);

        let mut delivered = false;
        for to in destinations {
            let message = match build_result_message(
                &self.settings.smtp_from,
                to,
                subject,
                html.clone(),
                plain.clone(),
            ) {
                Ok(message) => message,
                Err(err) => {
                    warn!(to, error = %err, "could not build result email");
                    continue;
                }
            };
            match self.send_with_backoff(message).await {
                Ok(()) => {
                    info!(id = %record.id, to, "delivered result email");
                    delivered = true;
                }
                Err(err) => error!(to, error = %err, "result email delivery failed"),
            }
        }
        delivered
    }

    /// Error and no-URL notices go to the original sender only.
    async fn notify_sender(&self, email: &ParsedEmail, subject: &str, body: String) {
        let Some(sender) = &email.from_addr else {
            warn!(subject = %email.subject, "cannot notify: message has no sender");
            return;
        };
        match build_notice_message(&self.settings.smtp_from, sender, subject, body) {
            Ok(message) => {
                if let Err(err) = self.send_with_backoff(message).await {
                    error!(to = %sender, error = %err, "notice delivery failed");
                }
            }
            Err(err) => warn!(to = %sender, error = %err, "could not build notice email"),
        }
    }

    async fn send_with_backoff(&self, message: Message) -> Result<()> {
        let mut last_err = None;
        for (attempt, delay) in backoff_schedule() {
            match self.smtp.send(message.clone()).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    warn!(attempt, error = %err, "SMTP send failed");
                    last_err = Some(anyhow!(err));
                }
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("SMTP send failed")))
    }

    async fn fetch_unseen(&self, folder: &str) -> Result<Vec<FetchedMessage>> {
        let mut last_err = None;
        for (attempt, delay) in backoff_schedule() {
            let settings = self.settings.clone();
            let folder_owned = folder.to_string();
            let result =
                task::spawn_blocking(move || fetch_unseen_blocking(&settings, &folder_owned))
                    .await
                    .map_err(|err| anyhow!(err).context("IMAP task panicked"))?;
            match result {
                Ok(messages) => return Ok(messages),
                Err(err) => {
                    warn!(folder, attempt, error = %err, "IMAP fetch failed");
                    last_err = Some(err);
                }
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("IMAP fetch failed")))
    }

    async fn move_message(&self, folder: &str, uid: u32, dest: &str) -> Result<()> {
        let mut last_err = None;
        for (attempt, delay) in backoff_schedule() {
            let settings = self.settings.clone();
            let folder_owned = folder.to_string();
            let dest_owned = dest.to_string();
            let result = task::spawn_blocking(move || {
                move_message_blocking(&settings, &folder_owned, uid, &dest_owned)
            })
            .await
            .map_err(|err| anyhow!(err).context("IMAP task panicked"))?;
            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(uid, dest, attempt, error = %err, "IMAP move failed");
                    last_err = Some(err);
                }
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("IMAP move failed")))
    }
}

/// Initial try plus one retry per backoff delay; `None` marks the final
/// attempt.
fn backoff_schedule() -> impl Iterator<Item = (usize, Option<Duration>)> {
    (0..=BACKOFF_DELAYS_SECS.len()).map(|attempt| {
        let delay = BACKOFF_DELAYS_SECS
            .get(attempt)
            .map(|secs| Duration::from_secs(*secs));
        (attempt + 1, delay)
    })
}

fn build_smtp(settings: &MailSettings) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
    let builder = if settings.smtp_port == 465 {
        AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.smtp_host)
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.smtp_host)
    }
    .with_context(|| format!("invalid SMTP relay {}", settings.smtp_host))?;

    let mut builder = builder
        .port(settings.smtp_port)
        .timeout(Some(Duration::from_secs(30)));
    if !settings.smtp_username.is_empty() {
        builder = builder.credentials(Credentials::new(
            settings.smtp_username.clone(),
            settings.smtp_password.clone(),
        ));
    }
    Ok(builder.build())
}

type ImapSession = imap::Session<native_tls::TlsStream<TcpStream>>;

fn imap_session(settings: &MailSettings) -> Result<ImapSession> {
    let addr = (settings.imap_host.as_str(), settings.imap_port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve IMAP host {}", settings.imap_host))?
        .next()
        .with_context(|| format!("no address for IMAP host {}", settings.imap_host))?;
    let tcp = TcpStream::connect_timeout(&addr, IMAP_OP_TIMEOUT).with_context(|| {
        format!(
            "failed to connect to IMAP server {}:{}",
            settings.imap_host, settings.imap_port
        )
    })?;
    // Per-operation timeouts so a hung server fails into the backoff
    // schedule instead of wedging the worker thread.
    tcp.set_read_timeout(Some(IMAP_OP_TIMEOUT))
        .context("failed to set IMAP read timeout")?;
    tcp.set_write_timeout(Some(IMAP_OP_TIMEOUT))
        .context("failed to set IMAP write timeout")?;

    let tls = native_tls::TlsConnector::builder()
        .build()
        .context("failed to build TLS connector")?;
    let tls_stream = tls
        .connect(&settings.imap_host, tcp)
        .map_err(|err| anyhow!("TLS handshake with {} failed: {err}", settings.imap_host))?;

    let mut client = imap::Client::new(tls_stream);
    client
        .read_greeting()
        .context("failed to read IMAP greeting")?;
    client
        .login(&settings.imap_username, &settings.imap_password)
        .map_err(|(err, _)| anyhow!(err))
        .context("IMAP login failed")
}

/// List UNSEEN messages in a folder, flagging each `\Seen` before handing
/// it over. A crash mid-processing leaves the message in the inbox but
/// never reprocessed; the tradeoff is no automatic retry.
fn fetch_unseen_blocking(settings: &MailSettings, folder: &str) -> Result<Vec<FetchedMessage>> {
    let mut session = imap_session(settings)?;
    session
        .select(folder)
        .with_context(|| format!("failed to select IMAP folder {folder}"))?;

    let mut uids: Vec<u32> = session
        .uid_search("UNSEEN")
        .context("UNSEEN search failed")?
        .into_iter()
        .collect();
    uids.sort_unstable();

    let mut messages = Vec::with_capacity(uids.len());
    for uid in uids {
        let fetches = session
            .uid_fetch(uid.to_string(), "BODY[]")
            .with_context(|| format!("failed to fetch message {uid}"))?;
        let Some(fetch) = fetches.iter().next() else {
            continue;
        };
        let Some(body) = fetch.body() else {
            warn!(uid, folder, "message fetch returned no body");
            continue;
        };
        session
            .uid_store(uid.to_string(), "+FLAGS (\\Seen)")
            .with_context(|| format!("failed to flag message {uid} as seen"))?;
        messages.push(FetchedMessage {
            uid,
            raw: body.to_vec(),
        });
    }

    let _ = session.logout();
    Ok(messages)
}

/// COPY to the destination, mark deleted, EXPUNGE.
fn move_message_blocking(
    settings: &MailSettings,
    folder: &str,
    uid: u32,
    dest: &str,
) -> Result<()> {
    let mut session = imap_session(settings)?;
    session
        .select(folder)
        .with_context(|| format!("failed to select IMAP folder {folder}"))?;
    // Destination may not exist yet on a fresh mailbox.
    let _ = session.create(dest);
    session
        .uid_copy(uid.to_string(), dest)
        .with_context(|| format!("failed to copy message {uid} to {dest}"))?;
    session
        .uid_store(uid.to_string(), "+FLAGS (\\Deleted)")
        .with_context(|| format!("failed to mark message {uid} deleted"))?;
    session.expunge().context("EXPUNGE failed")?;
    let _ = session.logout();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_is_four_attempts_with_spec_delays() {
        let schedule: Vec<_> = backoff_schedule().collect();
        assert_eq!(schedule.len(), 4);
        assert_eq!(schedule[0], (1, Some(Duration::from_secs(5))));
        assert_eq!(schedule[1], (2, Some(Duration::from_secs(15))));
        assert_eq!(schedule[2], (3, Some(Duration::from_secs(45))));
        assert_eq!(schedule[3], (4, None));
    }

    #[test]
    fn worker_requires_mail_hosts() {
        let settings = MailSettings::default();
        assert!(MailWorker::new(settings).is_err());

        let mut settings = MailSettings {
            imap_host: "imap.example.com".into(),
            ..MailSettings::default()
        };
        assert!(MailWorker::new(settings.clone()).is_err());
        settings.smtp_host = "smtp.example.com".into();
        settings.smtp_from = "scribe@example.com".into();
        assert!(MailWorker::new(settings).is_ok());
    }
}
