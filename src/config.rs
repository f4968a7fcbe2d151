use std::{env, fs, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default ceiling for a single downloaded audio file.
pub const DEFAULT_MAX_AUDIO_BYTES: u64 = 500 * 1024 * 1024;

/// Settings for the HTTP/WS frontend service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
        }
    }
}

impl ServerSettings {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connection settings for the external ASR service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriberSettings {
    pub base_url: String,
    pub poll_interval_secs: u64,
    pub wait_timeout_secs: u64,
}

impl Default for TranscriberSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9000".into(),
            poll_interval_secs: 5,
            wait_timeout_secs: 3600,
        }
    }
}

/// Fallback LLM configuration used when no tag config matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub api_endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_endpoint: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            timeout_secs: 120,
        }
    }
}

/// Filesystem roots and acquisition limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub audio_cache_days: i64,
    pub max_audio_bytes: u64,
    pub download_timeout_secs: u64,
    pub yt_dlp_path: Option<PathBuf>,
}

impl StorageSettings {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("scribe.db")
    }

    pub fn transcriptions_dir(&self) -> PathBuf {
        self.data_dir.join("transcriptions")
    }

    pub fn audio_cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache").join("audio")
    }

    pub fn tag_configs_path(&self) -> PathBuf {
        self.config_dir.join("tag_configs.json")
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.config_dir.join("secrets.json")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let dirs = [
            self.data_dir.clone(),
            self.transcriptions_dir(),
            self.audio_cache_dir(),
            self.config_dir.clone(),
        ];
        for dir in &dirs {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Periodic maintenance windows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CleanupSettings {
    pub interval_hours: u64,
    pub failed_retention_days: i64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            interval_hours: 6,
            failed_retention_days: 7,
        }
    }
}

/// IMAP mailbox names used by one mail pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailFolders {
    pub inbox: String,
    pub done: String,
    pub error: String,
}

/// Settings for the IMAP/SMTP mail worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailSettings {
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_username: String,
    pub imap_password: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub smtp_from: String,
    pub frontend_url: String,
    pub poll_interval_secs: u64,
    pub max_in_flight: usize,
    pub scribe_folders: MailFolders,
    pub episode_source_folders: MailFolders,
    pub episode_sources_return_address: String,
    pub default_tag: String,
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            imap_host: String::new(),
            imap_port: 993,
            imap_username: String::new(),
            imap_password: String::new(),
            smtp_host: String::new(),
            smtp_port: 587,
            smtp_username: String::new(),
            smtp_password: String::new(),
            smtp_from: String::new(),
            frontend_url: "http://localhost:8000".into(),
            poll_interval_secs: 300,
            max_in_flight: 3,
            scribe_folders: MailFolders {
                inbox: "ToScribe".into(),
                done: "ScribeDone".into(),
                error: "ScribeError".into(),
            },
            episode_source_folders: MailFolders {
                inbox: "EpisodeSources".into(),
                done: "EpisodeSourcesDone".into(),
                error: "EpisodeSourcesError".into(),
            },
            episode_sources_return_address: String::new(),
            default_tag: "default".into(),
        }
    }
}

/// Complete process configuration, assembled from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub transcriber: TranscriberSettings,
    pub llm: LlmSettings,
    pub storage: StorageSettings,
    pub cleanup: CleanupSettings,
    pub mail: MailSettings,
}

impl Settings {
    /// Build settings from the process environment. Absent variables fall
    /// back to defaults; malformed numeric values are logged and ignored.
    pub fn from_env() -> Result<Self> {
        let (default_data_dir, default_config_dir) = default_roots()?;

        let storage = StorageSettings {
            data_dir: env_path("SCRIBE_DATA_DIR", default_data_dir),
            config_dir: env_path("SCRIBE_CONFIG_DIR", default_config_dir),
            audio_cache_days: env_parse("SCRIBE_AUDIO_CACHE_DAYS", 7),
            max_audio_bytes: env_parse("SCRIBE_MAX_AUDIO_MB", 500u64) * 1024 * 1024,
            download_timeout_secs: env_parse("SCRIBE_DOWNLOAD_TIMEOUT_SECS", 600),
            yt_dlp_path: env::var_os("SCRIBE_YT_DLP_PATH").map(PathBuf::from),
        };

        let mail_defaults = MailSettings::default();
        let mail = MailSettings {
            imap_host: env_string("SCRIBE_IMAP_HOST", ""),
            imap_port: env_parse("SCRIBE_IMAP_PORT", mail_defaults.imap_port),
            imap_username: env_string("SCRIBE_IMAP_USERNAME", ""),
            imap_password: env_string("SCRIBE_IMAP_PASSWORD", ""),
            smtp_host: env_string("SCRIBE_SMTP_HOST", ""),
            smtp_port: env_parse("SCRIBE_SMTP_PORT", mail_defaults.smtp_port),
            smtp_username: env_string("SCRIBE_SMTP_USERNAME", ""),
            smtp_password: env_string("SCRIBE_SMTP_PASSWORD", ""),
            smtp_from: env_string("SCRIBE_SMTP_FROM", ""),
            frontend_url: env_string("SCRIBE_FRONTEND_URL", &mail_defaults.frontend_url),
            poll_interval_secs: env_parse(
                "SCRIBE_MAIL_POLL_INTERVAL_SECS",
                mail_defaults.poll_interval_secs,
            ),
            max_in_flight: env_parse("SCRIBE_MAIL_MAX_IN_FLIGHT", mail_defaults.max_in_flight),
            scribe_folders: MailFolders {
                inbox: env_string("SCRIBE_FOLDER_INBOX", &mail_defaults.scribe_folders.inbox),
                done: env_string("SCRIBE_FOLDER_DONE", &mail_defaults.scribe_folders.done),
                error: env_string("SCRIBE_FOLDER_ERROR", &mail_defaults.scribe_folders.error),
            },
            episode_source_folders: MailFolders {
                inbox: env_string(
                    "SCRIBE_FOLDER_EPISODE_SOURCES",
                    &mail_defaults.episode_source_folders.inbox,
                ),
                done: env_string(
                    "SCRIBE_FOLDER_EPISODE_SOURCES_DONE",
                    &mail_defaults.episode_source_folders.done,
                ),
                error: env_string(
                    "SCRIBE_FOLDER_EPISODE_SOURCES_ERROR",
                    &mail_defaults.episode_source_folders.error,
                ),
            },
            episode_sources_return_address: env_string("SCRIBE_EPISODE_SOURCES_RETURN_ADDRESS", ""),
            default_tag: env_string("SCRIBE_DEFAULT_TAG", &mail_defaults.default_tag),
        };

        Ok(Self {
            server: ServerSettings {
                host: env_string("SCRIBE_HOST", "0.0.0.0"),
                port: env_parse("SCRIBE_PORT", 8000),
            },
            transcriber: TranscriberSettings {
                base_url: env_string("SCRIBE_TRANSCRIBER_URL", "http://localhost:9000"),
                poll_interval_secs: env_parse("SCRIBE_TRANSCRIBER_POLL_SECS", 5),
                wait_timeout_secs: env_parse("SCRIBE_TRANSCRIBER_TIMEOUT_SECS", 3600),
            },
            llm: LlmSettings {
                api_endpoint: env_string("SCRIBE_LLM_ENDPOINT", "https://api.openai.com/v1"),
                model: env_string("SCRIBE_LLM_MODEL", "gpt-4o-mini"),
                timeout_secs: env_parse("SCRIBE_LLM_TIMEOUT_SECS", 120),
            },
            storage,
            cleanup: CleanupSettings {
                interval_hours: env_parse("SCRIBE_CLEANUP_INTERVAL_HOURS", 6),
                failed_retention_days: env_parse("SCRIBE_FAILED_RETENTION_DAYS", 7),
            },
            mail,
        })
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.storage.download_timeout_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.timeout_secs)
    }
}

fn default_roots() -> Result<(PathBuf, PathBuf)> {
    match ProjectDirs::from("", "", "scribe") {
        Some(dirs) => Ok((
            dirs.data_dir().to_path_buf(),
            dirs.config_dir().to_path_buf(),
        )),
        None => {
            let cwd = env::current_dir().context("failed to resolve working directory")?;
            Ok((cwd.join("data"), cwd.join("config")))
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    env::var_os(key)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or(default)
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(value) => match value.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(key, value, "ignoring unparseable environment override");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_paths_hang_off_data_dir() {
        let storage = StorageSettings {
            data_dir: PathBuf::from("/tmp/scribe-data"),
            config_dir: PathBuf::from("/tmp/scribe-config"),
            audio_cache_days: 7,
            max_audio_bytes: DEFAULT_MAX_AUDIO_BYTES,
            download_timeout_secs: 600,
            yt_dlp_path: None,
        };
        assert_eq!(storage.db_path(), PathBuf::from("/tmp/scribe-data/scribe.db"));
        assert_eq!(
            storage.audio_cache_dir(),
            PathBuf::from("/tmp/scribe-data/cache/audio")
        );
        assert_eq!(
            storage.tag_configs_path(),
            PathBuf::from("/tmp/scribe-config/tag_configs.json")
        );
    }

    #[test]
    fn defaults_match_documented_values() {
        let transcriber = TranscriberSettings::default();
        assert_eq!(transcriber.poll_interval_secs, 5);
        assert_eq!(transcriber.wait_timeout_secs, 3600);

        let mail = MailSettings::default();
        assert_eq!(mail.poll_interval_secs, 300);
        assert_eq!(mail.max_in_flight, 3);
        assert_eq!(mail.scribe_folders.inbox, "ToScribe");
        assert_eq!(mail.episode_source_folders.error, "EpisodeSourcesError");
    }
}
