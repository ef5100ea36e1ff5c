use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parley_transport::{
    DEFAULT_BASE_URL, DEFAULT_CHAIN_PATH, DEFAULT_COMPLETION_PATH, HttpTransportConfig,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::engine::{EngineConfig, SessionPolicy};
use crate::params::GenerationParams;

pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const CONVERSATIONS_FILE_NAME: &str = "conversations.json";
pub const ENV_PREFIX: &str = "PARLEY_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_completion_path")]
    pub completion_path: String,
    #[serde(default = "default_chain_path")]
    pub chain_path: String,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub system_instruction: Option<String>,
    #[serde(default)]
    pub session_policy: SessionPolicy,
    /// Conversation snapshot file. Defaults next to the settings file.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            completion_path: default_completion_path(),
            chain_path: default_chain_path(),
            connect_timeout_ms: None,
            temperature: None,
            max_tokens: None,
            system_instruction: None,
            session_policy: SessionPolicy::default(),
            store_path: None,
        }
    }
}

impl ClientSettings {
    pub fn normalized(mut self) -> Self {
        self.base_url = or_default(self.base_url, default_base_url);
        self.completion_path = or_default(self.completion_path, default_completion_path);
        self.chain_path = or_default(self.chain_path, default_chain_path);
        self.connect_timeout_ms = self.connect_timeout_ms.filter(|millis| *millis > 0);
        self.temperature = self.temperature.filter(|value| value.is_finite() && *value >= 0.0);
        self.max_tokens = self.max_tokens.filter(|tokens| *tokens > 0);
        self.system_instruction = self
            .system_instruction
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        self.store_path = self
            .store_path
            .filter(|path| !path.as_os_str().is_empty());
        self
    }

    pub fn transport_config(&self) -> HttpTransportConfig {
        let config = HttpTransportConfig::new(&self.base_url)
            .with_completion_path(&self.completion_path)
            .with_chain_path(&self.chain_path);
        match self.connect_timeout_ms {
            Some(millis) => config.with_connect_timeout(Duration::from_millis(millis)),
            None => config,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_policy(self.session_policy)
            .with_defaults(GenerationParams {
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                system_instruction: self.system_instruction.clone(),
                template: None,
            })
    }

    pub fn resolved_store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| SettingsStore::default_config_dir().join(CONVERSATIONS_FILE_NAME))
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ClientSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ClientSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Defaults, then the JSON file (a missing file contributes nothing), then
    /// `PARLEY_*` environment variables.
    fn load_from_disk(path: &Path) -> ClientSettings {
        let figment = Figment::from(Serialized::defaults(ClientSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<ClientSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                ClientSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ClientSettings) -> Result<(), SettingsError> {
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

        tracing::info!(path = %self.config_path.display(), "saved settings");
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

fn or_default(value: String, default: fn() -> String) -> String {
    let value = value.trim();
    if value.is_empty() {
        default()
    } else {
        value.to_string()
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_completion_path() -> String {
    DEFAULT_COMPLETION_PATH.to_string()
}

fn default_chain_path() -> String {
    DEFAULT_CHAIN_PATH.to_string()
}
