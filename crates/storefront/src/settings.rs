use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use storefront_llm::{DEFAULT_BASE_URL, ProviderConfig};

use crate::catalog::{
    ASSISTANT_REFRESH_AFTER, CachePolicy, DEFAULT_CATALOG_TTL, DEFAULT_MODEL_TTL, PromptWebhooks,
};
use crate::chat::StreamDelay;

pub const SETTINGS_DIRECTORY_NAME: &str = "storefront";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "STOREFRONT_";
pub const DATABASE_FILE_NAME: &str = "storefront.db";
/// `store_location` value selecting the process-local store.
pub const MEMORY_STORE_LOCATION: &str = ":memory:";
pub const DEFAULT_ASSISTANT_NAME: &str = "IT Support";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    Sqlite(PathBuf),
}

/// Startup configuration. Layered as defaults, then the JSON file, then `STOREFRONT_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorefrontSettings {
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub prompt_get_url: String,
    pub prompt_create_url: String,
    pub prompt_update_url: String,
    pub prompt_delete_url: String,
    pub stream_delay_min_ms: u64,
    pub stream_delay_max_ms: u64,
    pub run_poll_interval_ms: u64,
    pub run_timeout_secs: u64,
    pub catalog_ttl_secs: u64,
    pub assistant_refresh_after_secs: u64,
    /// Blank means the default database under the user's data directory.
    pub store_location: String,
    pub default_assistant: String,
}

impl Default for StorefrontSettings {
    fn default() -> Self {
        let delay = StreamDelay::default();
        Self {
            openai_api_key: String::new(),
            openai_base_url: DEFAULT_BASE_URL.to_string(),
            prompt_get_url: String::new(),
            prompt_create_url: String::new(),
            prompt_update_url: String::new(),
            prompt_delete_url: String::new(),
            stream_delay_min_ms: delay.min.as_millis() as u64,
            stream_delay_max_ms: delay.max.as_millis() as u64,
            run_poll_interval_ms: storefront_llm::DEFAULT_RUN_POLL_INTERVAL.as_millis() as u64,
            run_timeout_secs: storefront_llm::DEFAULT_RUN_TIMEOUT.as_secs(),
            catalog_ttl_secs: DEFAULT_CATALOG_TTL.as_secs(),
            assistant_refresh_after_secs: ASSISTANT_REFRESH_AFTER.as_secs(),
            store_location: String::new(),
            default_assistant: DEFAULT_ASSISTANT_NAME.to_string(),
        }
    }
}

impl StorefrontSettings {
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();

        self.openai_api_key = self.openai_api_key.trim().to_string();
        self.openai_base_url = non_blank_or(self.openai_base_url, defaults.openai_base_url);
        for url in [
            &mut self.prompt_get_url,
            &mut self.prompt_create_url,
            &mut self.prompt_update_url,
            &mut self.prompt_delete_url,
        ] {
            *url = url.trim().to_string();
        }
        if self.stream_delay_max_ms < self.stream_delay_min_ms {
            std::mem::swap(&mut self.stream_delay_min_ms, &mut self.stream_delay_max_ms);
        }
        if self.run_poll_interval_ms == 0 {
            self.run_poll_interval_ms = defaults.run_poll_interval_ms;
        }
        if self.run_timeout_secs == 0 {
            self.run_timeout_secs = defaults.run_timeout_secs;
        }
        if self.catalog_ttl_secs == 0 {
            self.catalog_ttl_secs = defaults.catalog_ttl_secs;
        }
        self.assistant_refresh_after_secs = self.assistant_refresh_after_secs.min(self.catalog_ttl_secs);
        self.store_location = self.store_location.trim().to_string();
        self.default_assistant = non_blank_or(self.default_assistant, defaults.default_assistant);
        self
    }

    pub fn has_api_key(&self) -> bool {
        !self.openai_api_key.is_empty()
    }

    /// Client configuration for `api_key`, or `None` when the key is blank.
    pub fn provider_config(&self, api_key: &str) -> Option<ProviderConfig> {
        if api_key.trim().is_empty() {
            return None;
        }
        Some(
            ProviderConfig::new(api_key, &self.openai_base_url)
                .with_run_poll_interval(Duration::from_millis(self.run_poll_interval_ms))
                .with_run_timeout(Duration::from_secs(self.run_timeout_secs)),
        )
    }

    pub fn prompt_webhooks(&self) -> PromptWebhooks {
        PromptWebhooks::new(
            Some(self.prompt_get_url.clone()),
            Some(self.prompt_create_url.clone()),
            Some(self.prompt_update_url.clone()),
            Some(self.prompt_delete_url.clone()),
        )
    }

    pub fn stream_delay(&self) -> StreamDelay {
        StreamDelay::new(
            Duration::from_millis(self.stream_delay_min_ms),
            Duration::from_millis(self.stream_delay_max_ms),
        )
    }

    pub fn prompt_cache_policy(&self) -> CachePolicy {
        CachePolicy::new(Duration::from_secs(self.catalog_ttl_secs))
    }

    pub fn assistant_cache_policy(&self) -> CachePolicy {
        self.prompt_cache_policy()
            .with_background_refresh(Duration::from_secs(self.assistant_refresh_after_secs))
    }

    /// Model lists never expire sooner than the other catalogs.
    pub fn model_cache_policy(&self) -> CachePolicy {
        CachePolicy::new(DEFAULT_MODEL_TTL.max(Duration::from_secs(self.catalog_ttl_secs)))
    }

    pub fn store_location(&self) -> StoreLocation {
        match self.store_location.as_str() {
            MEMORY_STORE_LOCATION => StoreLocation::Memory,
            "" => StoreLocation::Sqlite(default_database_path()),
            path => StoreLocation::Sqlite(PathBuf::from(path)),
        }
    }
}

fn non_blank_or(value: String, fallback: String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback
    } else {
        trimmed.to_string()
    }
}

pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".storefront"))
        .join(DATABASE_FILE_NAME)
}

/// Loaded settings plus the file they persist to.
pub struct SettingsStore {
    settings: Arc<ArcSwap<StorefrontSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".storefront"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_layers(&config_path, Some(ENV_PREFIX));
        Self::with_settings(config_path, settings)
    }

    /// File and defaults only; the process environment is ignored.
    pub fn from_file(config_path: PathBuf) -> Self {
        let settings = Self::load_layers(&config_path, None);
        Self::with_settings(config_path, settings)
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    fn with_settings(config_path: PathBuf, settings: StorefrontSettings) -> Self {
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<StorefrontSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: StorefrontSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_layers(path: &Path, env_prefix: Option<&str>) -> StorefrontSettings {
        let mut figment = Figment::from(Serialized::defaults(StorefrontSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }
        if let Some(prefix) = env_prefix {
            figment = figment.merge(Env::prefixed(prefix));
        }

        match figment.extract::<StorefrontSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                StorefrontSettings::default()
            }
        }
    }

    fn persist(&self, settings: &StorefrontSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;
        let temp_path = self.config_path.with_extension("json.tmp");

        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;
        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SettingsStore::from_file(dir.path().join(SETTINGS_FILE_NAME));

        let settings = store.settings();
        assert_eq!(*settings, StorefrontSettings::default());
        assert!(!settings.has_api_key());
        assert_eq!(settings.provider_config(&settings.openai_api_key), None);
        assert_eq!(settings.prompt_webhooks(), PromptWebhooks::default());
    }

    #[test]
    fn file_values_override_defaults_and_are_normalized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(
            &path,
            r#"{
                "openai_api_key": "  sk-file  ",
                "openai_base_url": "   ",
                "prompt_get_url": " https://hooks.example.com/get ",
                "stream_delay_min_ms": 50,
                "stream_delay_max_ms": 5,
                "run_timeout_secs": 0,
                "store_location": ":memory:"
            }"#,
        )
        .expect("write settings");

        let settings = SettingsStore::from_file(path).settings();
        assert_eq!(settings.openai_api_key, "sk-file");
        assert_eq!(settings.openai_base_url, DEFAULT_BASE_URL);
        assert_eq!(
            settings.prompt_webhooks().get_url.as_deref(),
            Some("https://hooks.example.com/get")
        );
        assert_eq!(settings.prompt_webhooks().create_url, None);
        assert_eq!(
            settings.stream_delay(),
            StreamDelay::new(Duration::from_millis(5), Duration::from_millis(50))
        );
        assert_eq!(settings.run_timeout_secs, storefront_llm::DEFAULT_RUN_TIMEOUT.as_secs());
        assert_eq!(settings.store_location(), StoreLocation::Memory);

        let config = settings
            .provider_config(&settings.openai_api_key)
            .expect("provider config");
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.run_timeout, storefront_llm::DEFAULT_RUN_TIMEOUT);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{"run_timeout_secs": "soon"}"#).expect("write settings");

        let store = SettingsStore::from_file(path);
        assert_eq!(*store.settings(), StorefrontSettings::default());
    }

    #[test]
    fn update_persists_and_swaps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::from_file(path.clone());

        let mut settings = (*store.settings()).clone();
        settings.prompt_create_url = "https://hooks.example.com/create".to_string();
        settings.default_assistant = "  ".to_string();
        store.update(settings).expect("update settings");

        assert_eq!(store.settings().default_assistant, DEFAULT_ASSISTANT_NAME);
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = SettingsStore::from_file(path).settings();
        assert_eq!(
            reloaded.prompt_create_url,
            "https://hooks.example.com/create"
        );
    }

    #[test]
    fn assistant_refresh_never_exceeds_the_ttl() {
        let settings = StorefrontSettings {
            catalog_ttl_secs: 30,
            assistant_refresh_after_secs: 90,
            ..StorefrontSettings::default()
        }
        .normalized();

        let policy = settings.assistant_cache_policy();
        assert_eq!(policy.ttl, Duration::from_secs(30));
        assert_eq!(policy.refresh_after, Some(Duration::from_secs(30)));
    }
}
