use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound on tags carried by one transcription.
const MAX_TAGS: usize = 20;

/// Lifecycle of a transcription job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Downloading,
    Transcribing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Transcribing => "transcribing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "downloading" => Some(JobStatus::Downloading),
            "transcribing" => Some(JobStatus::Transcribing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full transcription row as stored and served by the API.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionRecord {
    pub id: String,
    pub source_type: String,
    pub source_url: String,
    pub title: Option<String>,
    pub channel: Option<String>,
    pub thumbnail_url: Option<String>,
    pub upload_date: Option<String>,
    pub duration_seconds: Option<f64>,
    pub audio_path: Option<String>,
    pub audio_format: Option<String>,
    pub audio_cached_until: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub progress: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub transcribed_at: Option<DateTime<Utc>>,
    pub language: Option<String>,
    pub model_used: Option<String>,
    pub word_count: Option<i64>,
    pub segments_count: Option<i64>,
    pub full_text: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub tags: Vec<String>,
    pub source_context: Option<String>,
    pub transcription_path: Option<String>,
}

/// Persisted LLM summary. The API key itself is never stored, only whether
/// one was used.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRecord {
    pub id: String,
    pub transcription_id: String,
    pub api_endpoint: String,
    pub model: String,
    pub system_prompt: String,
    pub api_key_used: bool,
    pub tags: Vec<String>,
    pub config_source: String,
    pub summary_text: String,
    pub created_at: DateTime<Utc>,
    pub generation_ms: i64,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
}

/// Preserved email body linked to a transcription.
#[derive(Debug, Clone, Serialize)]
pub struct EpisodeSourceRecord {
    pub id: String,
    pub transcription_id: String,
    pub email_subject: Option<String>,
    pub email_from: Option<String>,
    pub source_text: String,
    pub matched_url: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a submission insert.
#[derive(Debug)]
pub enum InsertOutcome {
    Created(TranscriptionRecord),
    Duplicate(String),
}

/// Filters for the paginated listing endpoint.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub skip: i64,
    pub limit: i64,
    pub status: Option<JobStatus>,
    pub tag: Option<String>,
    pub search: Option<String>,
}

/// One page of listing results.
#[derive(Debug, Serialize)]
pub struct ListPage {
    pub total: i64,
    pub items: Vec<TranscriptionRecord>,
}

/// Metadata captured by the downloader, persisted before transcription.
#[derive(Debug, Clone, Default)]
pub struct MediaMetadata {
    pub title: Option<String>,
    pub channel: Option<String>,
    pub thumbnail_url: Option<String>,
    pub upload_date: Option<String>,
    pub duration_seconds: Option<f64>,
    pub audio_path: Option<String>,
    pub audio_format: Option<String>,
}

/// Indexed fields copied from a finished artifact onto the record.
#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    pub language: String,
    pub model_used: String,
    pub word_count: i64,
    pub segments_count: i64,
    pub full_text: String,
    pub transcription_path: String,
}

/// Normalize caller-supplied tags: lowercase, trim, dedupe preserving
/// order, cap at [`MAX_TAGS`]. Entries that still violate the allowed
/// character class afterwards are rejected.
pub fn normalize_tags<S: AsRef<str>>(input: &[S]) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for raw in input {
        let tag = raw.as_ref().trim().to_lowercase();
        if tag.is_empty() {
            continue;
        }
        if tag.len() > 50
            || !tag
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' || ch == '-')
        {
            bail!("invalid tag '{tag}': tags are 1-50 chars of [a-z0-9_-]");
        }
        if !out.contains(&tag) {
            out.push(tag);
        }
    }
    out.truncate(MAX_TAGS);
    Ok(out)
}

fn prefixed_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}{}", &hex[..12])
}

/// SQLite-backed store for transcriptions, summaries, and episode sources.
///
/// A single connection behind a mutex keeps all writes on one writer, which
/// is how the dedup race on `source_url` stays a clean constraint error.
pub struct Store {
    conn: Mutex<Connection>,
}

const RECORD_COLUMNS: &str = "id, source_type, source_url, title, channel, thumbnail_url, \
     upload_date, duration_seconds, audio_path, audio_format, audio_cached_until, status, \
     progress, created_at, started_at, transcribed_at, language, model_used, word_count, \
     segments_count, full_text, error_message, retry_count, tags, source_context, \
     transcription_path";

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).with_context(|| {
            format!("failed to open scribe database {}", path.as_ref().display())
        })?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create a pending record unless the source URL is already known.
    /// Insert and uniqueness check run on one connection, so a concurrent
    /// duplicate surfaces as a constraint violation and is reported as
    /// [`InsertOutcome::Duplicate`].
    pub fn insert_pending(
        &self,
        id: &str,
        source_type: &str,
        source_url: &str,
        tags: &[String],
        source_context: Option<&str>,
    ) -> Result<InsertOutcome> {
        let conn = self.conn.lock().expect("store lock poisoned");
        if let Some(existing) = find_id_by_url(&conn, source_url)? {
            return Ok(InsertOutcome::Duplicate(existing));
        }

        let now = Utc::now();
        let tags_json = serde_json::to_string(tags)?;
        let inserted = conn.execute(
            "INSERT INTO transcriptions \
               (id, source_type, source_url, status, progress, created_at, retry_count, tags, source_context) \
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, 0, ?5, ?6)",
            params![id, source_type, source_url, now, tags_json, source_context],
        );

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                // Lost the race to a concurrent writer; report theirs.
                let existing = find_id_by_url(&conn, source_url)?
                    .context("unique violation without a matching row")?;
                return Ok(InsertOutcome::Duplicate(existing));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to insert pending record {id}"));
            }
        }

        let record = fetch_record(&conn, id)?.context("pending record vanished after insert")?;
        Ok(InsertOutcome::Created(record))
    }

    pub fn get(&self, id: &str) -> Result<Option<TranscriptionRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        fetch_record(&conn, id)
    }

    pub fn list(&self, filter: &ListFilter) -> Result<ListPage> {
        let conn = self.conn.lock().expect("store lock poisoned");

        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            clauses.push("t.status = ?".into());
            args.push(Box::new(status.as_str().to_string()));
        }
        if let Some(tag) = &filter.tag {
            clauses.push("t.tags LIKE '%\"' || ? || '\"%'".into());
            args.push(Box::new(tag.clone()));
        }

        let search = filter
            .search
            .as_deref()
            .map(fts_match_expression)
            .filter(|expr| !expr.is_empty());

        let (from, order) = if let Some(expr) = &search {
            clauses.push("transcriptions_fts MATCH ?".into());
            args.push(Box::new(expr.clone()));
            (
                "transcriptions t JOIN transcriptions_fts ON t.rowid = transcriptions_fts.rowid",
                "ORDER BY bm25(transcriptions_fts)",
            )
        } else {
            ("transcriptions t", "ORDER BY t.created_at DESC")
        };

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM {from} {where_clause}");
        let total: i64 = conn.query_row(
            &count_sql,
            rusqlite::params_from_iter(args.iter().map(|arg| arg.as_ref())),
            |row| row.get(0),
        )?;

        let limit = filter.limit.clamp(1, 200);
        let skip = filter.skip.max(0);
        let list_sql = format!(
            "SELECT {cols} FROM {from} {where_clause} {order} LIMIT {limit} OFFSET {skip}",
            cols = RECORD_COLUMNS
                .split(", ")
                .map(|col| format!("t.{col}"))
                .collect::<Vec<_>>()
                .join(", "),
        );
        let mut stmt = conn.prepare(&list_sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(
            args.iter().map(|arg| arg.as_ref()),
        ))?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(row_to_record(row)?);
        }
        Ok(ListPage { total, items })
    }

    /// Move a record to a new status. Progress only ever ratchets upward;
    /// `started_at` is stamped on the first downloading transition and
    /// `transcribed_at` on completion.
    pub fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        progress: i64,
        error_message: Option<&str>,
    ) -> Result<Option<TranscriptionRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let now = Utc::now();
        let changed = conn.execute(
            "UPDATE transcriptions SET \
               status = ?2, \
               progress = MAX(progress, ?3), \
               error_message = COALESCE(?4, error_message), \
               started_at = CASE WHEN ?2 = 'downloading' AND started_at IS NULL THEN ?5 ELSE started_at END, \
               transcribed_at = CASE WHEN ?2 = 'completed' THEN ?5 ELSE transcribed_at END \
             WHERE id = ?1",
            params![id, status.as_str(), progress, error_message, now],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        fetch_record(&conn, id)
    }

    pub fn set_media_metadata(
        &self,
        id: &str,
        metadata: &MediaMetadata,
        audio_cached_until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE transcriptions SET \
               title = ?2, channel = ?3, thumbnail_url = ?4, upload_date = ?5, \
               duration_seconds = ?6, audio_path = ?7, audio_format = ?8, audio_cached_until = ?9 \
             WHERE id = ?1",
            params![
                id,
                metadata.title,
                metadata.channel,
                metadata.thumbnail_url,
                metadata.upload_date,
                metadata.duration_seconds,
                metadata.audio_path,
                metadata.audio_format,
                audio_cached_until,
            ],
        )?;
        Ok(())
    }

    /// Backfill creator notes discovered after the record was created.
    pub fn set_source_context(&self, id: &str, source_context: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE transcriptions SET source_context = ?2 WHERE id = ?1 AND source_context IS NULL",
            params![id, source_context],
        )?;
        Ok(())
    }

    pub fn set_transcription_result(&self, id: &str, result: &TranscriptionResult) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE transcriptions SET \
               language = ?2, model_used = ?3, word_count = ?4, segments_count = ?5, \
               full_text = ?6, transcription_path = ?7 \
             WHERE id = ?1",
            params![
                id,
                result.language,
                result.model_used,
                result.word_count,
                result.segments_count,
                result.full_text,
                result.transcription_path,
            ],
        )?;
        Ok(())
    }

    /// Replace a record's tags with a normalized set.
    pub fn replace_tags(&self, id: &str, tags: &[String]) -> Result<Option<TranscriptionRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let tags_json = serde_json::to_string(tags)?;
        let changed = conn.execute(
            "UPDATE transcriptions SET tags = ?2 WHERE id = ?1",
            params![id, tags_json],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        fetch_record(&conn, id)
    }

    /// Delete a record; summaries and episode sources cascade. Returns the
    /// removed row so the caller can unlink its disk artifacts.
    pub fn delete(&self, id: &str) -> Result<Option<TranscriptionRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let Some(record) = fetch_record(&conn, id)? else {
            return Ok(None);
        };
        conn.execute("DELETE FROM transcriptions WHERE id = ?1", params![id])?;
        Ok(Some(record))
    }

    /// Distinct tags currently attached to any record, alphabetical.
    pub fn tags_in_use(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare("SELECT tags FROM transcriptions")?;
        let mut rows = stmt.query([])?;
        let mut seen: Vec<String> = Vec::new();
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            let tags: Vec<String> = serde_json::from_str(&raw).unwrap_or_default();
            for tag in tags {
                if !seen.contains(&tag) {
                    seen.push(tag);
                }
            }
        }
        seen.sort();
        Ok(seen)
    }

    /// Records whose cached audio has passed its expiry. The stored path is
    /// cleared here; the caller unlinks the files.
    pub fn take_expired_audio(&self, now: DateTime<Utc>) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, audio_path FROM transcriptions \
             WHERE audio_path IS NOT NULL AND audio_cached_until IS NOT NULL \
               AND audio_cached_until < ?1",
        )?;
        let mut rows = stmt.query(params![now])?;
        let mut expired = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let path: String = row.get(1)?;
            expired.push((id, path));
        }
        drop(rows);
        drop(stmt);
        for (id, _) in &expired {
            conn.execute(
                "UPDATE transcriptions SET audio_path = NULL, audio_cached_until = NULL WHERE id = ?1",
                params![id],
            )?;
        }
        Ok(expired)
    }

    /// Remove failed records created before the cutoff; returns them so the
    /// caller can unlink any artifacts.
    pub fn delete_failed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<TranscriptionRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM transcriptions WHERE status = 'failed' AND created_at < ?1"
        ))?;
        let mut rows = stmt.query(params![cutoff])?;
        let mut removed = Vec::new();
        while let Some(row) = rows.next()? {
            removed.push(row_to_record(row)?);
        }
        drop(rows);
        drop(stmt);
        for record in &removed {
            conn.execute(
                "DELETE FROM transcriptions WHERE id = ?1",
                params![record.id],
            )?;
        }
        Ok(removed)
    }

    pub fn insert_summary(
        &self,
        transcription_id: &str,
        api_endpoint: &str,
        model: &str,
        system_prompt: &str,
        api_key_used: bool,
        tags: &[String],
        config_source: &str,
        summary_text: &str,
        generation_ms: i64,
        prompt_tokens: Option<i64>,
        completion_tokens: Option<i64>,
    ) -> Result<SummaryRecord> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let record = SummaryRecord {
            id: prefixed_id("sum_"),
            transcription_id: transcription_id.to_string(),
            api_endpoint: api_endpoint.to_string(),
            model: model.to_string(),
            system_prompt: system_prompt.to_string(),
            api_key_used,
            tags: tags.to_vec(),
            config_source: config_source.to_string(),
            summary_text: summary_text.to_string(),
            created_at: Utc::now(),
            generation_ms,
            prompt_tokens,
            completion_tokens,
        };
        conn.execute(
            "INSERT INTO summaries \
               (id, transcription_id, api_endpoint, model, system_prompt, api_key_used, tags, \
                config_source, summary_text, created_at, generation_ms, prompt_tokens, completion_tokens) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                record.id,
                record.transcription_id,
                record.api_endpoint,
                record.model,
                record.system_prompt,
                record.api_key_used,
                serde_json::to_string(&record.tags)?,
                record.config_source,
                record.summary_text,
                record.created_at,
                record.generation_ms,
                record.prompt_tokens,
                record.completion_tokens,
            ],
        )
        .with_context(|| format!("failed to insert summary for {transcription_id}"))?;
        Ok(record)
    }

    pub fn get_summary(&self, id: &str) -> Result<Option<SummaryRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row(
            "SELECT id, transcription_id, api_endpoint, model, system_prompt, api_key_used, tags, \
                    config_source, summary_text, created_at, generation_ms, prompt_tokens, completion_tokens \
             FROM summaries WHERE id = ?1",
            params![id],
            row_to_summary,
        )
        .optional()
        .context("failed to load summary")
    }

    pub fn list_summaries(&self, transcription_id: Option<&str>) -> Result<Vec<SummaryRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut out = Vec::new();
        match transcription_id {
            Some(tid) => {
                let mut stmt = conn.prepare(
                    "SELECT id, transcription_id, api_endpoint, model, system_prompt, api_key_used, \
                            tags, config_source, summary_text, created_at, generation_ms, \
                            prompt_tokens, completion_tokens \
                     FROM summaries WHERE transcription_id = ?1 ORDER BY created_at DESC",
                )?;
                let mut rows = stmt.query(params![tid])?;
                while let Some(row) = rows.next()? {
                    out.push(row_to_summary(row)?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, transcription_id, api_endpoint, model, system_prompt, api_key_used, \
                            tags, config_source, summary_text, created_at, generation_ms, \
                            prompt_tokens, completion_tokens \
                     FROM summaries ORDER BY created_at DESC",
                )?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    out.push(row_to_summary(row)?);
                }
            }
        }
        Ok(out)
    }

    pub fn delete_summary(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let changed = conn.execute("DELETE FROM summaries WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn insert_episode_source(
        &self,
        transcription_id: &str,
        source_text: &str,
        matched_url: &str,
        email_subject: Option<&str>,
        email_from: Option<&str>,
    ) -> Result<EpisodeSourceRecord> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let record = EpisodeSourceRecord {
            id: prefixed_id("es_"),
            transcription_id: transcription_id.to_string(),
            email_subject: email_subject.map(str::to_string),
            email_from: email_from.map(str::to_string),
            source_text: source_text.to_string(),
            matched_url: matched_url.to_string(),
            created_at: Utc::now(),
        };
        conn.execute(
            "INSERT INTO episode_sources \
               (id, transcription_id, email_subject, email_from, source_text, matched_url, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.transcription_id,
                record.email_subject,
                record.email_from,
                record.source_text,
                record.matched_url,
                record.created_at,
            ],
        )
        .with_context(|| format!("failed to insert episode source for {transcription_id}"))?;
        Ok(record)
    }

    pub fn list_episode_sources(&self, transcription_id: &str) -> Result<Vec<EpisodeSourceRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, transcription_id, email_subject, email_from, source_text, matched_url, created_at \
             FROM episode_sources WHERE transcription_id = ?1 ORDER BY created_at DESC",
        )?;
        let mut rows = stmt.query(params![transcription_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(EpisodeSourceRecord {
                id: row.get(0)?,
                transcription_id: row.get(1)?,
                email_subject: row.get(2)?,
                email_from: row.get(3)?,
                source_text: row.get(4)?,
                matched_url: row.get(5)?,
                created_at: row.get(6)?,
            });
        }
        Ok(out)
    }
}

fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS transcriptions (
            id TEXT PRIMARY KEY,
            source_type TEXT NOT NULL,
            source_url TEXT NOT NULL UNIQUE,
            title TEXT,
            channel TEXT,
            thumbnail_url TEXT,
            upload_date TEXT,
            duration_seconds REAL,
            audio_path TEXT,
            audio_format TEXT,
            audio_cached_until TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            progress INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            started_at TEXT,
            transcribed_at TEXT,
            language TEXT,
            model_used TEXT,
            word_count INTEGER,
            segments_count INTEGER,
            full_text TEXT,
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            tags TEXT NOT NULL DEFAULT '[]',
            source_context TEXT,
            transcription_path TEXT
        );

        CREATE TABLE IF NOT EXISTS summaries (
            id TEXT PRIMARY KEY,
            transcription_id TEXT NOT NULL REFERENCES transcriptions(id) ON DELETE CASCADE,
            api_endpoint TEXT NOT NULL,
            model TEXT NOT NULL,
            system_prompt TEXT NOT NULL,
            api_key_used INTEGER NOT NULL DEFAULT 0,
            tags TEXT NOT NULL DEFAULT '[]',
            config_source TEXT NOT NULL,
            summary_text TEXT NOT NULL,
            created_at TEXT NOT NULL,
            generation_ms INTEGER NOT NULL,
            prompt_tokens INTEGER,
            completion_tokens INTEGER
        );

        CREATE TABLE IF NOT EXISTS episode_sources (
            id TEXT PRIMARY KEY,
            transcription_id TEXT NOT NULL REFERENCES transcriptions(id) ON DELETE CASCADE,
            email_subject TEXT,
            email_from TEXT,
            source_text TEXT NOT NULL,
            matched_url TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_transcriptions_status ON transcriptions(status);
        CREATE INDEX IF NOT EXISTS idx_summaries_transcription ON summaries(transcription_id);

        CREATE VIRTUAL TABLE IF NOT EXISTS transcriptions_fts USING fts5(
            title, channel, full_text,
            content='transcriptions', content_rowid='rowid'
        );

        CREATE TRIGGER IF NOT EXISTS transcriptions_fts_insert
        AFTER INSERT ON transcriptions BEGIN
            INSERT INTO transcriptions_fts(rowid, title, channel, full_text)
            VALUES (new.rowid, new.title, new.channel, new.full_text);
        END;

        CREATE TRIGGER IF NOT EXISTS transcriptions_fts_delete
        AFTER DELETE ON transcriptions BEGIN
            INSERT INTO transcriptions_fts(transcriptions_fts, rowid, title, channel, full_text)
            VALUES ('delete', old.rowid, old.title, old.channel, old.full_text);
        END;

        CREATE TRIGGER IF NOT EXISTS transcriptions_fts_update
        AFTER UPDATE ON transcriptions BEGIN
            INSERT INTO transcriptions_fts(transcriptions_fts, rowid, title, channel, full_text)
            VALUES ('delete', old.rowid, old.title, old.channel, old.full_text);
            INSERT INTO transcriptions_fts(rowid, title, channel, full_text)
            VALUES (new.rowid, new.title, new.channel, new.full_text);
        END;
        "#,
    )
    .context("failed to initialise scribe schema")?;
    Ok(())
}

fn find_id_by_url(conn: &Connection, source_url: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT id FROM transcriptions WHERE source_url = ?1",
        params![source_url],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .context("failed to check source_url uniqueness")
}

fn fetch_record(conn: &Connection, id: &str) -> Result<Option<TranscriptionRecord>> {
    conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM transcriptions WHERE id = ?1"),
        params![id],
        row_to_record,
    )
    .optional()
    .with_context(|| format!("failed to load transcription {id}"))
}

fn row_to_record(row: &Row) -> rusqlite::Result<TranscriptionRecord> {
    let status_raw: String = row.get(11)?;
    let tags_raw: String = row.get(23)?;
    Ok(TranscriptionRecord {
        id: row.get(0)?,
        source_type: row.get(1)?,
        source_url: row.get(2)?,
        title: row.get(3)?,
        channel: row.get(4)?,
        thumbnail_url: row.get(5)?,
        upload_date: row.get(6)?,
        duration_seconds: row.get(7)?,
        audio_path: row.get(8)?,
        audio_format: row.get(9)?,
        audio_cached_until: row.get(10)?,
        status: JobStatus::parse(&status_raw).unwrap_or(JobStatus::Failed),
        progress: row.get(12)?,
        created_at: row.get(13)?,
        started_at: row.get(14)?,
        transcribed_at: row.get(15)?,
        language: row.get(16)?,
        model_used: row.get(17)?,
        word_count: row.get(18)?,
        segments_count: row.get(19)?,
        full_text: row.get(20)?,
        error_message: row.get(21)?,
        retry_count: row.get(22)?,
        tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
        source_context: row.get(24)?,
        transcription_path: row.get(25)?,
    })
}

fn row_to_summary(row: &Row) -> rusqlite::Result<SummaryRecord> {
    let tags_raw: String = row.get(6)?;
    Ok(SummaryRecord {
        id: row.get(0)?,
        transcription_id: row.get(1)?,
        api_endpoint: row.get(2)?,
        model: row.get(3)?,
        system_prompt: row.get(4)?,
        api_key_used: row.get(5)?,
        tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
        config_source: row.get(7)?,
        summary_text: row.get(8)?,
        created_at: row.get(9)?,
        generation_ms: row.get(10)?,
        prompt_tokens: row.get(11)?,
        completion_tokens: row.get(12)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

/// Quote each whitespace token so arbitrary user input cannot break FTS5
/// query syntax.
fn fts_match_expression(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "")))
        .filter(|token| token.len() > 2)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(store: &Store, id: &str, url: &str) -> TranscriptionRecord {
        match store
            .insert_pending(id, "youtube", url, &["podcast".into()], None)
            .unwrap()
        {
            InsertOutcome::Created(record) => record,
            InsertOutcome::Duplicate(existing) => panic!("unexpected duplicate {existing}"),
        }
    }

    #[test]
    fn duplicate_source_url_reports_existing_id() {
        let store = Store::open_in_memory().unwrap();
        pending(&store, "youtube_abc12345678", "https://youtu.be/abc12345678");

        let outcome = store
            .insert_pending(
                "youtube_abc12345678",
                "youtube",
                "https://youtu.be/abc12345678",
                &[],
                None,
            )
            .unwrap();
        match outcome {
            InsertOutcome::Duplicate(existing) => assert_eq!(existing, "youtube_abc12345678"),
            InsertOutcome::Created(_) => panic!("expected duplicate"),
        }

        let page = store.list(&ListFilter { limit: 50, ..Default::default() }).unwrap();
        assert_eq!(page.total, 1);
    }

    #[test]
    fn progress_never_decreases() {
        let store = Store::open_in_memory().unwrap();
        pending(&store, "youtube_abc12345678", "https://youtu.be/abc12345678");

        store
            .update_status("youtube_abc12345678", JobStatus::Transcribing, 50, None)
            .unwrap();
        let record = store
            .update_status("youtube_abc12345678", JobStatus::Downloading, 10, None)
            .unwrap()
            .unwrap();
        assert_eq!(record.progress, 50);
    }

    #[test]
    fn status_transitions_stamp_timestamps() {
        let store = Store::open_in_memory().unwrap();
        pending(&store, "youtube_abc12345678", "https://youtu.be/abc12345678");

        let downloading = store
            .update_status("youtube_abc12345678", JobStatus::Downloading, 10, None)
            .unwrap()
            .unwrap();
        assert!(downloading.started_at.is_some());
        assert!(downloading.transcribed_at.is_none());

        let completed = store
            .update_status("youtube_abc12345678", JobStatus::Completed, 100, None)
            .unwrap()
            .unwrap();
        assert!(completed.transcribed_at.is_some());
    }

    #[test]
    fn delete_cascades_to_summaries_and_sources() {
        let store = Store::open_in_memory().unwrap();
        pending(&store, "youtube_abc12345678", "https://youtu.be/abc12345678");
        store
            .insert_summary(
                "youtube_abc12345678",
                "https://api.openai.com/v1",
                "gpt-4o-mini",
                "Summarize.",
                true,
                &["podcast".into()],
                "tag:podcast",
                "<p>Summary</p>",
                1200,
                Some(900),
                Some(120),
            )
            .unwrap();
        store
            .insert_episode_source(
                "youtube_abc12345678",
                "body",
                "https://youtu.be/abc12345678",
                Some("subject"),
                Some("a@example.com"),
            )
            .unwrap();

        store.delete("youtube_abc12345678").unwrap().unwrap();
        assert!(store.list_summaries(Some("youtube_abc12345678")).unwrap().is_empty());
        assert!(
            store
                .list_episode_sources("youtube_abc12345678")
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn search_matches_full_text() {
        let store = Store::open_in_memory().unwrap();
        pending(&store, "youtube_abc12345678", "https://youtu.be/abc12345678");
        pending(&store, "youtube_zzz99999999", "https://youtu.be/zzz99999999");
        store
            .set_transcription_result(
                "youtube_abc12345678",
                &TranscriptionResult {
                    language: "en".into(),
                    model_used: "whisper".into(),
                    word_count: 4,
                    segments_count: 1,
                    full_text: "sourdough starter maintenance tips".into(),
                    transcription_path: "/tmp/a.json".into(),
                },
            )
            .unwrap();

        let page = store
            .list(&ListFilter {
                limit: 50,
                search: Some("sourdough".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, "youtube_abc12345678");
    }

    #[test]
    fn tag_filter_and_tags_in_use() {
        let store = Store::open_in_memory().unwrap();
        pending(&store, "youtube_abc12345678", "https://youtu.be/abc12345678");
        store
            .insert_pending(
                "youtube_zzz99999999",
                "youtube",
                "https://youtu.be/zzz99999999",
                &["digest".into(), "recipe".into()],
                None,
            )
            .unwrap();

        assert_eq!(store.tags_in_use().unwrap(), vec!["digest", "podcast", "recipe"]);

        let page = store
            .list(&ListFilter {
                limit: 50,
                tag: Some("digest".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, "youtube_zzz99999999");
    }

    #[test]
    fn expired_audio_is_taken_once() {
        let store = Store::open_in_memory().unwrap();
        pending(&store, "youtube_abc12345678", "https://youtu.be/abc12345678");
        store
            .set_media_metadata(
                "youtube_abc12345678",
                &MediaMetadata {
                    audio_path: Some("/tmp/audio.mp3".into()),
                    audio_format: Some("mp3".into()),
                    ..Default::default()
                },
                Some(Utc::now() - chrono::Duration::days(1)),
            )
            .unwrap();

        let expired = store.take_expired_audio(Utc::now()).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].1, "/tmp/audio.mp3");
        assert!(store.take_expired_audio(Utc::now()).unwrap().is_empty());

        let record = store.get("youtube_abc12345678").unwrap().unwrap();
        assert!(record.audio_path.is_none());
    }

    #[test]
    fn normalize_tags_is_idempotent() {
        let raw = vec![
            "  Recipe ".to_string(),
            "DIGEST".to_string(),
            "recipe".to_string(),
        ];
        let once = normalize_tags(&raw).unwrap();
        assert_eq!(once, vec!["recipe", "digest"]);
        let twice = normalize_tags(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_tags_rejects_bad_characters() {
        assert!(normalize_tags(&["ok-tag".to_string()]).is_ok());
        assert!(normalize_tags(&["bad tag".to_string()]).is_err());
        assert!(normalize_tags(&["a".repeat(51)]).is_err());
    }

    #[test]
    fn failed_records_age_out() {
        let store = Store::open_in_memory().unwrap();
        pending(&store, "youtube_abc12345678", "https://youtu.be/abc12345678");
        store
            .update_status(
                "youtube_abc12345678",
                JobStatus::Failed,
                10,
                Some("download failed"),
            )
            .unwrap();

        // Nothing young enough to delete yet.
        let removed = store
            .delete_failed_before(Utc::now() - chrono::Duration::days(7))
            .unwrap();
        assert!(removed.is_empty());

        let removed = store
            .delete_failed_before(Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert!(store.get("youtube_abc12345678").unwrap().is_none());
    }
}
