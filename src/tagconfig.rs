use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::config::LlmSettings;

/// Default system prompt installed on first read of the tag config file.
const DEFAULT_SYSTEM_PROMPT: &str = "You are a careful assistant that summarizes audio \
transcripts. Capture the key points, arguments, and takeaways; keep the summary faithful \
to what was actually said.";

/// Per-tag LLM routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagConfig {
    pub api_endpoint: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_ref: Option<String>,
    pub system_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_emails: Option<Vec<String>>,
}

/// Effective configuration for one summarization run.
#[derive(Debug, Clone)]
pub struct ResolvedLlmConfig {
    pub api_endpoint: String,
    pub model: String,
    pub api_key: String,
    pub system_prompt: String,
    pub config_source: String,
    pub destination_emails: Option<Vec<String>>,
}

impl ResolvedLlmConfig {
    pub fn api_key_used(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// Caller-supplied overrides layered on top of the resolved tag config.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub api_endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
}

/// File-backed tag configuration and secret store.
///
/// Both files are re-read on every request so out-of-band edits take effect
/// without a restart. Writes validate the full document and land via a temp
/// file rename.
#[derive(Debug, Clone)]
pub struct TagConfigStore {
    tag_configs_path: PathBuf,
    secrets_path: PathBuf,
    llm_defaults: LlmSettings,
}

impl TagConfigStore {
    pub fn new(tag_configs_path: PathBuf, secrets_path: PathBuf, llm_defaults: LlmSettings) -> Self {
        Self {
            tag_configs_path,
            secrets_path,
            llm_defaults,
        }
    }

    fn default_config(&self) -> TagConfig {
        TagConfig {
            api_endpoint: self.llm_defaults.api_endpoint.clone(),
            model: self.llm_defaults.model.clone(),
            api_key_ref: Some("openai".into()),
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            destination_emails: None,
        }
    }

    /// Read the tag config file, creating it with a `default` entry on
    /// first use.
    pub fn load(&self) -> Result<BTreeMap<String, TagConfig>> {
        if !self.tag_configs_path.exists() {
            let mut initial = BTreeMap::new();
            initial.insert("default".to_string(), self.default_config());
            self.save(&initial)?;
            return Ok(initial);
        }
        let raw = fs::read_to_string(&self.tag_configs_path).with_context(|| {
            format!(
                "failed to read tag configs {}",
                self.tag_configs_path.display()
            )
        })?;
        let mut configs: BTreeMap<String, TagConfig> =
            serde_json::from_str(&raw).with_context(|| {
                format!(
                    "malformed tag config JSON {}",
                    self.tag_configs_path.display()
                )
            })?;
        if !configs.contains_key("default") {
            configs.insert("default".to_string(), self.default_config());
        }
        Ok(configs)
    }

    /// Validate and persist the whole tag config document atomically.
    pub fn save(&self, configs: &BTreeMap<String, TagConfig>) -> Result<()> {
        for (name, config) in configs {
            validate_config(name, config)?;
        }
        let serialised =
            serde_json::to_string_pretty(configs).context("failed to serialise tag configs")?;
        write_atomic(&self.tag_configs_path, &serialised)
    }

    pub fn upsert(&self, name: &str, config: TagConfig) -> Result<()> {
        validate_config(name, &config)?;
        let mut configs = self.load()?;
        configs.insert(name.to_string(), config);
        self.save(&configs)
    }

    /// Remove a named entry. The `default` entry cannot be removed.
    pub fn remove(&self, name: &str) -> Result<bool> {
        if name == "default" {
            bail!("the default tag config cannot be deleted");
        }
        let mut configs = self.load()?;
        let removed = configs.remove(name).is_some();
        if removed {
            self.save(&configs)?;
        }
        Ok(removed)
    }

    /// Resolve the effective config for a transcription's tags, first
    /// matching tag wins, falling back to the `default` entry, with caller
    /// overrides applied last.
    pub fn resolve(&self, tags: &[String], overrides: &ConfigOverrides) -> Result<ResolvedLlmConfig> {
        let configs = self.load()?;

        let (config, config_source) = tags
            .iter()
            .find_map(|tag| {
                configs
                    .get(tag)
                    .map(|config| (config.clone(), format!("tag:{tag}")))
            })
            .unwrap_or_else(|| {
                let default = configs
                    .get("default")
                    .cloned()
                    .unwrap_or_else(|| self.default_config());
                (default, "system_default".to_string())
            });

        let api_key = match &overrides.api_key {
            Some(key) => key.clone(),
            None => config
                .api_key_ref
                .as_deref()
                .map(|reference| self.resolve_api_key(reference))
                .unwrap_or_default(),
        };

        Ok(ResolvedLlmConfig {
            api_endpoint: overrides
                .api_endpoint
                .clone()
                .unwrap_or(config.api_endpoint),
            model: overrides.model.clone().unwrap_or(config.model),
            api_key,
            system_prompt: overrides
                .system_prompt
                .clone()
                .unwrap_or(config.system_prompt),
            config_source,
            destination_emails: config.destination_emails,
        })
    }

    /// Turn an `api_key_ref` into a raw key: environment first
    /// (`<REF_UPPER>_API_KEY`), then the secret file, else empty.
    pub fn resolve_api_key(&self, reference: &str) -> String {
        let env_key = format!(
            "{}_API_KEY",
            reference.to_uppercase().replace(['-', '.'], "_")
        );
        if let Ok(value) = env::var(&env_key) {
            if !value.trim().is_empty() {
                return value;
            }
        }
        self.load_secrets()
            .ok()
            .and_then(|secrets| secrets.get(reference).cloned())
            .unwrap_or_default()
    }

    fn load_secrets(&self) -> Result<BTreeMap<String, String>> {
        if !self.secrets_path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&self.secrets_path)
            .with_context(|| format!("failed to read secrets {}", self.secrets_path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("malformed secrets JSON {}", self.secrets_path.display()))
    }

    /// Names of stored secrets. Values never leave this module except to
    /// the summarizer at the point of use.
    pub fn secret_names(&self) -> Result<Vec<String>> {
        Ok(self.load_secrets()?.into_keys().collect())
    }

    pub fn set_secret(&self, name: &str, value: &str) -> Result<()> {
        if name.trim().is_empty() {
            bail!("secret name must not be empty");
        }
        let mut secrets = self.load_secrets()?;
        secrets.insert(name.to_string(), value.to_string());
        let serialised =
            serde_json::to_string_pretty(&secrets).context("failed to serialise secrets")?;
        write_atomic(&self.secrets_path, &serialised)
    }

    pub fn delete_secret(&self, name: &str) -> Result<bool> {
        let mut secrets = self.load_secrets()?;
        let removed = secrets.remove(name).is_some();
        if removed {
            let serialised =
                serde_json::to_string_pretty(&secrets).context("failed to serialise secrets")?;
            write_atomic(&self.secrets_path, &serialised)?;
        }
        Ok(removed)
    }
}

fn validate_config(name: &str, config: &TagConfig) -> Result<()> {
    if name.trim().is_empty() {
        bail!("tag config name must not be empty");
    }
    if config.api_endpoint.trim().is_empty() {
        bail!("tag config '{name}' has an empty api_endpoint");
    }
    if config.model.trim().is_empty() {
        bail!("tag config '{name}' has an empty model");
    }
    Ok(())
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path.parent().context("config path has no parent directory")?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> TagConfigStore {
        TagConfigStore::new(
            dir.join("tag_configs.json"),
            dir.join("secrets.json"),
            LlmSettings::default(),
        )
    }

    fn config(endpoint: &str, destination: Option<&str>) -> TagConfig {
        TagConfig {
            api_endpoint: endpoint.into(),
            model: "gpt-4o-mini".into(),
            api_key_ref: None,
            system_prompt: "Summarize.".into(),
            destination_emails: destination.map(|addr| vec![addr.to_string()]),
        }
    }

    #[test]
    fn first_load_creates_default_entry() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let configs = store.load().unwrap();
        assert!(configs.contains_key("default"));
        assert!(dir.path().join("tag_configs.json").exists());
    }

    #[test]
    fn first_matching_tag_wins_in_listed_order() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .upsert("recipe", config("https://recipe.example/v1", None))
            .unwrap();
        store
            .upsert("digest", config("https://digest.example/v1", None))
            .unwrap();

        let resolved = store
            .resolve(
                &["recipe".into(), "digest".into()],
                &ConfigOverrides::default(),
            )
            .unwrap();
        assert_eq!(resolved.api_endpoint, "https://recipe.example/v1");
        assert_eq!(resolved.config_source, "tag:recipe");

        let reversed = store
            .resolve(
                &["digest".into(), "recipe".into()],
                &ConfigOverrides::default(),
            )
            .unwrap();
        assert_eq!(reversed.config_source, "tag:digest");
    }

    #[test]
    fn unmatched_tags_fall_back_to_system_default() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let resolved = store
            .resolve(&["nonexistent".into()], &ConfigOverrides::default())
            .unwrap();
        assert_eq!(resolved.config_source, "system_default");
    }

    #[test]
    fn overrides_layer_on_top_of_tag_config() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .upsert("recipe", config("https://recipe.example/v1", None))
            .unwrap();

        let resolved = store
            .resolve(
                &["recipe".into()],
                &ConfigOverrides {
                    model: Some("gpt-4o".into()),
                    api_key: Some("sk-override".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(resolved.api_endpoint, "https://recipe.example/v1");
        assert_eq!(resolved.model, "gpt-4o");
        assert_eq!(resolved.api_key, "sk-override");
        assert!(resolved.api_key_used());
    }

    #[test]
    fn api_key_resolution_prefers_environment() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.set_secret("scribe-test-ref", "from-file").unwrap();

        assert_eq!(store.resolve_api_key("scribe-test-ref"), "from-file");

        unsafe { env::set_var("SCRIBE_TEST_REF_API_KEY", "from-env") };
        assert_eq!(store.resolve_api_key("scribe-test-ref"), "from-env");
        unsafe { env::remove_var("SCRIBE_TEST_REF_API_KEY") };

        assert_eq!(store.resolve_api_key("unknown-ref"), "");
    }

    #[test]
    fn secret_listing_exposes_names_only() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.set_secret("openai", "sk-secret").unwrap();

        let names = store.secret_names().unwrap();
        assert_eq!(names, vec!["openai"]);

        assert!(store.delete_secret("openai").unwrap());
        assert!(!store.delete_secret("openai").unwrap());
    }

    #[test]
    fn invalid_documents_are_rejected_before_replace() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut configs = store.load().unwrap();
        configs.insert("broken".into(), config("", None));
        assert!(store.save(&configs).is_err());

        // The file on disk still parses.
        assert!(store.load().is_ok());
    }

    #[test]
    fn default_entry_cannot_be_deleted() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.load().unwrap();
        assert!(store.remove("default").is_err());
        assert!(!store.remove("missing").unwrap());
    }
}
